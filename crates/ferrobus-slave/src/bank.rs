//! In-memory point banks.
//!
//! Production hosts keep register storage in the application and register
//! their own handlers; these banks back simulators and tests with a
//! ready-made data model covering all four point spaces.

use crate::handlers::HandlerRegistry;
use ferrobus_core::pdu::{ExceptionCode, PointValues, TargetType};
use std::ops::Range;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Banks {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

fn checked_range(start: u16, quantity: u16, len: usize) -> Result<Range<usize>, ExceptionCode> {
    let start = usize::from(start);
    let end = start + usize::from(quantity);
    if quantity == 0 || end > len {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start..end)
}

/// Shared, lock-protected storage for all four point spaces. Clones share
/// the same storage, so a test can keep one handle while the slave owns
/// the handlers.
#[derive(Debug, Clone)]
pub struct DataBank {
    banks: Arc<RwLock<Banks>>,
}

impl DataBank {
    pub fn new(
        coil_count: usize,
        discrete_input_count: usize,
        holding_register_count: usize,
        input_register_count: usize,
    ) -> Self {
        Self {
            banks: Arc::new(RwLock::new(Banks {
                coils: vec![false; coil_count],
                discrete_inputs: vec![false; discrete_input_count],
                holding_registers: vec![0; holding_register_count],
                input_registers: vec![0; input_register_count],
            })),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Banks> {
        self.banks.read().expect("point bank lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Banks> {
        self.banks.write().expect("point bank lock poisoned")
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.read().coils.get(usize::from(address)).copied()
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.read()
            .holding_registers
            .get(usize::from(address))
            .copied()
    }

    pub fn set_coil(&self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        let mut banks = self.write();
        let slot = banks
            .coils
            .get_mut(usize::from(address))
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        *slot = value;
        Ok(())
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        let mut banks = self.write();
        let slot = banks
            .discrete_inputs
            .get_mut(usize::from(address))
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        *slot = value;
        Ok(())
    }

    pub fn set_holding_register(&self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        let mut banks = self.write();
        let slot = banks
            .holding_registers
            .get_mut(usize::from(address))
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        *slot = value;
        Ok(())
    }

    pub fn set_input_register(&self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        let mut banks = self.write();
        let slot = banks
            .input_registers
            .get_mut(usize::from(address))
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        *slot = value;
        Ok(())
    }

    /// Wire read and write handlers for all four point spaces into
    /// `registry`, backed by this bank.
    pub fn install(&self, registry: &mut HandlerRegistry) {
        let bank = self.clone();
        registry.on_read(
            TargetType::Coil,
            Box::new(move |start, quantity| {
                let banks = bank.read();
                let range = checked_range(start, quantity, banks.coils.len())?;
                Ok(PointValues::Bits(banks.coils[range].to_vec()))
            }),
        );

        let bank = self.clone();
        registry.on_read(
            TargetType::DiscreteInput,
            Box::new(move |start, quantity| {
                let banks = bank.read();
                let range = checked_range(start, quantity, banks.discrete_inputs.len())?;
                Ok(PointValues::Bits(banks.discrete_inputs[range].to_vec()))
            }),
        );

        let bank = self.clone();
        registry.on_read(
            TargetType::HoldingRegister,
            Box::new(move |start, quantity| {
                let banks = bank.read();
                let range = checked_range(start, quantity, banks.holding_registers.len())?;
                Ok(PointValues::Words(banks.holding_registers[range].to_vec()))
            }),
        );

        let bank = self.clone();
        registry.on_read(
            TargetType::InputRegister,
            Box::new(move |start, quantity| {
                let banks = bank.read();
                let range = checked_range(start, quantity, banks.input_registers.len())?;
                Ok(PointValues::Words(banks.input_registers[range].to_vec()))
            }),
        );

        let bank = self.clone();
        registry.on_write(
            TargetType::Coil,
            Box::new(move |start, values| {
                let PointValues::Bits(bits) = values else {
                    return Err(ExceptionCode::SlaveDeviceFailure);
                };
                let mut banks = bank.write();
                let range = checked_range(start, bits.len() as u16, banks.coils.len())?;
                banks.coils[range].copy_from_slice(bits);
                Ok(())
            }),
        );

        let bank = self.clone();
        registry.on_write(
            TargetType::HoldingRegister,
            Box::new(move |start, values| {
                let PointValues::Words(words) = values else {
                    return Err(ExceptionCode::SlaveDeviceFailure);
                };
                let mut banks = bank.write();
                let range =
                    checked_range(start, words.len() as u16, banks.holding_registers.len())?;
                banks.holding_registers[range].copy_from_slice(words);
                Ok(())
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::DataBank;
    use crate::dispatch::dispatch;
    use crate::handlers::HandlerRegistry;

    fn bank_registry(bank: &DataBank) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        bank.install(&mut registry);
        registry
    }

    #[test]
    fn reads_and_writes_flow_through_the_bank() {
        let bank = DataBank::new(16, 16, 16, 16);
        bank.set_holding_register(0, 42).unwrap();
        let mut registry = bank_registry(&bank);

        let response = dispatch(&mut registry, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(response, vec![0x03, 0x02, 0x00, 0x2A]);

        let response = dispatch(&mut registry, &[0x06, 0x00, 0x01, 0x12, 0x34]);
        assert_eq!(response, vec![0x06, 0x00, 0x01, 0x12, 0x34]);
        assert_eq!(bank.holding_register(1), Some(0x1234));

        let response = dispatch(&mut registry, &[0x05, 0x00, 0x03, 0xFF, 0x00]);
        assert_eq!(response, vec![0x05, 0x00, 0x03, 0xFF, 0x00]);
        assert_eq!(bank.coil(3), Some(true));
    }

    #[test]
    fn out_of_range_reads_answer_illegal_data_address() {
        let bank = DataBank::new(8, 8, 8, 8);
        let mut registry = bank_registry(&bank);

        let response = dispatch(&mut registry, &[0x01, 0x00, 0x06, 0x00, 0x04]);
        assert_eq!(response, vec![0x81, 0x02]);
    }

    #[test]
    fn mask_write_composes_read_and_write() {
        let bank = DataBank::new(4, 4, 4, 4);
        bank.set_holding_register(2, 0x0012).unwrap();
        let mut registry = bank_registry(&bank);

        let response = dispatch(
            &mut registry,
            &[0x16, 0x00, 0x02, 0x00, 0xF2, 0x00, 0x25],
        );
        assert_eq!(response, vec![0x16, 0x00, 0x02, 0x00, 0xF2, 0x00, 0x25]);
        assert_eq!(bank.holding_register(2), Some(0x0017));
    }

    #[test]
    fn read_write_multiple_round_trips_through_storage() {
        let bank = DataBank::new(4, 4, 8, 4);
        let mut registry = bank_registry(&bank);

        let response = dispatch(
            &mut registry,
            &[0x17, 0x00, 0x04, 0x00, 0x02, 0x00, 0x04, 0x00, 0x02, 0x04, 0xBE, 0xEF, 0xCA, 0xFE],
        );
        assert_eq!(response, vec![0x17, 0x04, 0xBE, 0xEF, 0xCA, 0xFE]);
        assert_eq!(bank.holding_register(4), Some(0xBEEF));
        assert_eq!(bank.holding_register(5), Some(0xCAFE));
    }

    #[test]
    fn discrete_inputs_are_read_only_points() {
        let bank = DataBank::new(4, 4, 4, 4);
        bank.set_discrete_input(1, true).unwrap();
        let mut registry = bank_registry(&bank);

        let response = dispatch(&mut registry, &[0x02, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(response, vec![0x02, 0x01, 0b0000_0010]);
    }
}
