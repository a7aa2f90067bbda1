use crate::MasterError;
use ferrobus_core::pdu::FunctionCode;
use tokio::sync::oneshot;

/// Transaction ids are a u8 cycling 1..=255; id 0 is never issued, so at
/// most 255 requests can be in flight at once.
pub(crate) const MAX_IN_FLIGHT: usize = 255;

const SLOT_COUNT: usize = 256;

pub(crate) type Completion = oneshot::Sender<Result<Vec<u8>, MasterError>>;

/// What the receive loop needs to pair and sanity-check a response.
pub(crate) struct PendingTransaction {
    pub expected_function: FunctionCode,
    pub quantity: u16,
    pub complete: Completion,
}

/// Pending-transaction table indexed by transaction id.
///
/// Each id is claimed at send time and released exactly once: by the
/// receive loop on response, by the sender on timeout, or by `fail_all`
/// on disconnect.
pub(crate) struct TransactionTable {
    slots: Vec<Option<PendingTransaction>>,
    next_id: u8,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT).map(|_| None).collect(),
            next_id: 1,
        }
    }

    /// Claim the next transaction id. The counter wraps 255 -> 1; an
    /// occupied slot means 255 requests are already waiting, and the send
    /// fails instead of evicting the oldest.
    pub fn insert(
        &mut self,
        expected_function: FunctionCode,
        quantity: u16,
    ) -> Result<(u8, oneshot::Receiver<Result<Vec<u8>, MasterError>>), MasterError> {
        let id = self.next_id;
        if self.slots[usize::from(id)].is_some() {
            return Err(MasterError::TooManyRequests);
        }

        let (tx, rx) = oneshot::channel();
        self.slots[usize::from(id)] = Some(PendingTransaction {
            expected_function,
            quantity,
            complete: tx,
        });
        self.next_id = if id == u8::MAX { 1 } else { id + 1 };
        Ok((id, rx))
    }

    pub fn remove(&mut self, id: u8) -> Option<PendingTransaction> {
        if id == 0 {
            return None;
        }
        self.slots[usize::from(id)].take()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Fail and drop every pending transaction.
    pub fn fail_all(&mut self, make_error: impl Fn() -> MasterError) {
        for slot in &mut self.slots {
            if let Some(pending) = slot.take() {
                let _ = pending.complete.send(Err(make_error()));
            }
        }
    }
}
