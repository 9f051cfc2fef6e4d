//! Test data builders for creating test objects

use boardlink::processor::{OperatorConfig, StageSpec};
use boardlink::types::module;
use boardlink::{Address, Descriptor};

/// Builder for board producer descriptors
pub struct ProducerBuilder {
    address: Address,
    size: u8,
    components: u8,
    scale: Option<f32>,
}

impl ProducerBuilder {
    pub fn new(module: u8, register: u8) -> Self {
        Self {
            address: Address::unindexed(module, register),
            size: 2,
            components: 1,
            scale: None,
        }
    }

    /// Three-axis accelerometer, 2 bytes per axis
    pub fn accelerometer() -> Self {
        Self::new(module::ACCELEROMETER, 0x04).components(3).scale(1000.0)
    }

    /// Indexed analog input on pin 0
    pub fn adc() -> Self {
        Self::new(module::GPIO, 0x07).id(0)
    }

    pub fn id(mut self, id: u8) -> Self {
        self.address = self.address.with_id(id);
        self
    }

    pub fn size(mut self, size: u8) -> Self {
        self.size = size;
        self
    }

    pub fn components(mut self, components: u8) -> Self {
        self.components = components;
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn build(self) -> Descriptor {
        match (self.components, self.scale) {
            (1, None) => Descriptor::uint(self.address, self.size).unwrap(),
            (1, Some(scale)) => Descriptor::float(self.address, self.size, true, scale).unwrap(),
            (n, scale) => Descriptor::vector(self.address, n, self.size, scale.unwrap_or(1.0)).unwrap(),
        }
    }
}

/// A chain of `n` 4-sample averagers fed by `source`
pub fn averager_chain(source: Descriptor, n: usize) -> Vec<StageSpec> {
    (0..n)
        .map(|i| {
            let config = OperatorConfig::Average {
                samples: 4,
                high_pass: false,
            };
            if i == 0 {
                StageSpec::from_source(source.clone(), config)
            } else {
                StageSpec::after(i - 1, config)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink::DataKind;

    #[test]
    fn test_producer_builder() {
        let acc = ProducerBuilder::accelerometer().build();
        assert_eq!(acc.kind(), DataKind::Vector);
        assert_eq!(acc.split().len(), 3);

        let adc = ProducerBuilder::adc().build();
        assert!(adc.is_indexed());
        assert_eq!(adc.kind(), DataKind::Uint);
    }
}
