//! Per-function-code handler registry.
//!
//! The host application owns all point storage; the engine reaches it
//! only through these callbacks. A handler may reject a request by
//! returning an [`ExceptionCode`], which goes back on the wire verbatim.

use crate::SlaveError;
use ferrobus_core::pdu::{ExceptionCode, PointValues, TargetType};
use tracing::warn;

pub type ReadHandler =
    Box<dyn FnMut(u16, u16) -> Result<PointValues, ExceptionCode> + Send>;
pub type WriteHandler =
    Box<dyn FnMut(u16, &PointValues) -> Result<(), ExceptionCode> + Send>;
pub type ExceptionStatusHandler = Box<dyn FnMut() -> Result<u8, ExceptionCode> + Send>;
pub type DiagnosticsHandler =
    Box<dyn FnMut(u16, &[u8]) -> Result<Vec<u8>, ExceptionCode> + Send>;
pub type ReportSlaveIdHandler =
    Box<dyn FnMut() -> Result<SlaveIdReport, ExceptionCode> + Send>;
pub type DeviceIdentificationHandler =
    Box<dyn FnMut(u8, u8) -> Result<DeviceIdentity, ExceptionCode> + Send>;
pub type ErrorHandler = Box<dyn FnMut(&SlaveError) + Send>;

/// FC 17 payload supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveIdReport {
    pub slave_id: Vec<u8>,
    pub run_indicator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdObject {
    pub object_id: u8,
    pub value: Vec<u8>,
}

/// FC 43 identity supplied by the host; the engine handles stream
/// filtering and the response sub-header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub conformity_level: u8,
    pub objects: Vec<DeviceIdObject>,
}

/// Callbacks keyed by function code. Absent handlers produce exception 1
/// (illegal function) on the wire.
#[derive(Default)]
pub struct HandlerRegistry {
    read_coils: Option<ReadHandler>,
    read_discrete_inputs: Option<ReadHandler>,
    read_holding_registers: Option<ReadHandler>,
    read_input_registers: Option<ReadHandler>,
    write_coils: Option<WriteHandler>,
    write_holding_registers: Option<WriteHandler>,
    exception_status: Option<ExceptionStatusHandler>,
    diagnostics: Option<DiagnosticsHandler>,
    report_slave_id: Option<ReportSlaveIdHandler>,
    device_identification: Option<DeviceIdentificationHandler>,
    error_hook: Option<ErrorHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the read handler for one point space.
    pub fn on_read(&mut self, target: TargetType, handler: ReadHandler) -> &mut Self {
        match target {
            TargetType::Coil => self.read_coils = Some(handler),
            TargetType::DiscreteInput => self.read_discrete_inputs = Some(handler),
            TargetType::HoldingRegister => self.read_holding_registers = Some(handler),
            TargetType::InputRegister => self.read_input_registers = Some(handler),
        }
        self
    }

    /// Register the write handler for a writable point space. Writes to
    /// read-only spaces have no function code, so those registrations are
    /// dropped with a warning.
    pub fn on_write(&mut self, target: TargetType, handler: WriteHandler) -> &mut Self {
        match target {
            TargetType::Coil => self.write_coils = Some(handler),
            TargetType::HoldingRegister => self.write_holding_registers = Some(handler),
            TargetType::DiscreteInput | TargetType::InputRegister => {
                warn!(?target, "write handler for read-only target ignored");
            }
        }
        self
    }

    pub fn on_read_exception_status(&mut self, handler: ExceptionStatusHandler) -> &mut Self {
        self.exception_status = Some(handler);
        self
    }

    pub fn on_diagnostics(&mut self, handler: DiagnosticsHandler) -> &mut Self {
        self.diagnostics = Some(handler);
        self
    }

    pub fn on_report_slave_id(&mut self, handler: ReportSlaveIdHandler) -> &mut Self {
        self.report_slave_id = Some(handler);
        self
    }

    pub fn on_read_device_identification(
        &mut self,
        handler: DeviceIdentificationHandler,
    ) -> &mut Self {
        self.device_identification = Some(handler);
        self
    }

    /// Hook for frame-level failures that are dropped silently on the
    /// wire (bad CRC, unrecognized function codes, buffer overflow).
    pub fn on_error(&mut self, handler: ErrorHandler) -> &mut Self {
        self.error_hook = Some(handler);
        self
    }

    pub(crate) fn reader(&mut self, target: TargetType) -> Option<&mut ReadHandler> {
        match target {
            TargetType::Coil => self.read_coils.as_mut(),
            TargetType::DiscreteInput => self.read_discrete_inputs.as_mut(),
            TargetType::HoldingRegister => self.read_holding_registers.as_mut(),
            TargetType::InputRegister => self.read_input_registers.as_mut(),
        }
    }

    pub(crate) fn writer(&mut self, target: TargetType) -> Option<&mut WriteHandler> {
        match target {
            TargetType::Coil => self.write_coils.as_mut(),
            TargetType::HoldingRegister => self.write_holding_registers.as_mut(),
            TargetType::DiscreteInput | TargetType::InputRegister => None,
        }
    }

    pub(crate) fn exception_status(&mut self) -> Option<&mut ExceptionStatusHandler> {
        self.exception_status.as_mut()
    }

    pub(crate) fn diagnostics(&mut self) -> Option<&mut DiagnosticsHandler> {
        self.diagnostics.as_mut()
    }

    pub(crate) fn report_slave_id(&mut self) -> Option<&mut ReportSlaveIdHandler> {
        self.report_slave_id.as_mut()
    }

    pub(crate) fn device_identification(&mut self) -> Option<&mut DeviceIdentificationHandler> {
        self.device_identification.as_mut()
    }

    pub(crate) fn emit_error(&mut self, error: &SlaveError) {
        if let Some(hook) = self.error_hook.as_mut() {
            hook(error);
        }
    }
}
