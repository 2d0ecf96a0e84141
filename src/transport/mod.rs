//! The byte-level IO seam.
//!
//! Everything above this trait is pure; a PC/SC binding, a serial bridge
//! or the in-memory [`MockTag`](crate::mocktag::MockTag) all plug in
//! here. One APDU is in flight at a time; the protocol has no
//! concurrency of its own.

mod error;

pub use self::error::Error;

use crate::apdu::{Apdu, ResponseApdu};
use log::debug;
use uuid::Uuid;

/// A channel that can carry one APDU exchange at a time
pub trait Transport {
    /// Send a command APDU and block until the reader returns
    /// `(data, SW1, SW2)`.
    ///
    /// Implementations should enforce their own per-command timeout
    /// (2 s is a good default for contact readers); a timeout is an
    /// [`Error::Timeout`] and poisons any session running over this
    /// transport.
    fn transmit(&mut self, apdu: &Apdu) -> Result<ResponseApdu, Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transmit(&mut self, apdu: &Apdu) -> Result<ResponseApdu, Error> {
        (**self).transmit(apdu)
    }
}

/// One logged exchange: every round-trip gets a correlation id so debug
/// logs from concurrent readers stay untangled.
pub(crate) fn exchange<T: Transport + ?Sized>(
    transport: &mut T,
    apdu: &Apdu,
) -> Result<ResponseApdu, Error> {
    let xchg = Uuid::new_v4();
    debug!(
        "xchg={} >> cla=0x{:02X} ins=0x{:02X} lc={}",
        xchg,
        apdu.cla,
        apdu.ins,
        apdu.data.len()
    );

    let response = transport.transmit(apdu)?;

    debug!(
        "xchg={} << sw={} len={}",
        xchg,
        response.status(),
        response.data.len()
    );
    Ok(response)
}
