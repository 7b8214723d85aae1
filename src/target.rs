use crate::dmi::{DmiDescriptor, SharedDmiCache};
use crate::payload::Payload;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Target side of the transaction fabric.
///
/// Everything an initiator socket needs from the component it is bound to:
/// the timed transport, the untimed debug transport, DMI negotiation and
/// the invalidation back-channel.
pub trait TlmTarget: Send {
    /// Processes `tx` and accounts consumed time against the initiator's
    /// local `offset`. The offset must never decrease.
    fn b_transport(&mut self, tx: &mut Payload, offset: &mut Duration);

    /// Debug transport: same data path as [`TlmTarget::b_transport`] but
    /// without timing or side effects on the simulation schedule. Returns
    /// the number of bytes moved and leaves the response untouched on
    /// success.
    fn transport_dbg(&mut self, tx: &mut Payload) -> usize;

    /// Asks for a direct memory pointer covering the address of `tx`.
    fn get_direct_mem_ptr(&mut self, _tx: &Payload) -> Option<DmiDescriptor> {
        None
    }

    /// Registers the DMI cache of a bound initiator so the target can
    /// broadcast invalidations to it.
    fn bind_dmi_cache(&mut self, _cache: SharedDmiCache) {}
}

pub type SharedTarget = Arc<Mutex<dyn TlmTarget>>;
