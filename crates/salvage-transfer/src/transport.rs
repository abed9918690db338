/// The frame transport seam.
///
/// The link layer is a black box offering three primitives: register a
/// per-frame callback, send one frame for a named request, and release a
/// named request. `udp::UdpTransport` implements it over UDP datagrams and
/// `crate::sim::SimTransport` in memory.

pub mod udp;

use std::sync::Arc;

use crate::error::TransportError;

/// Longest request name the datagram header can carry.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Frame kind as carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Receiver's interest in a named request; payload is the name.
    Announce,
    /// File data.
    Data,
}

impl FrameKind {
    pub fn to_byte(self) -> u8 {
        match self {
            FrameKind::Announce => 0,
            FrameKind::Data => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FrameKind::Announce),
            1 => Some(FrameKind::Data),
            _ => None,
        }
    }
}

/// Link rate requested for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateHint {
    /// Let the link pick.
    #[default]
    Adaptive,
    /// Fixed rate index.
    Fixed(u8),
}

impl RateHint {
    const ADAPTIVE: u8 = 0xFF;

    /// Map an operator-supplied rate; negative means adaptive.
    pub fn from_signed(rate: i32) -> Self {
        if rate < 0 {
            RateHint::Adaptive
        } else {
            RateHint::Fixed(rate.min(Self::ADAPTIVE as i32 - 1) as u8)
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            RateHint::Adaptive => Self::ADAPTIVE,
            RateHint::Fixed(r) => r,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        if b == Self::ADAPTIVE {
            RateHint::Adaptive
        } else {
            RateHint::Fixed(b)
        }
    }
}

/// A frame as delivered to the registered handler.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub kind: FrameKind,
    /// Link-specific encoding info (the rate byte for our transports).
    pub encoding_hint: u64,
    pub sequence: u16,
    pub payload: Vec<u8>,
    pub name: String,
}

/// Per-frame callback. Runs on the transport's delivery thread and must not block.
pub type FrameHandler = Box<dyn Fn(InboundFrame) + Send + Sync>;

pub(crate) type SharedHandler = Arc<dyn Fn(InboundFrame) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Install the frame callback, replacing any previous one.
    fn register(&self, handler: FrameHandler);

    /// Send one frame for the named request.
    fn send(
        &self,
        kind: FrameKind,
        rate: RateHint,
        sequence: u16,
        payload: &[u8],
        name: &str,
    ) -> Result<(), TransportError>;

    /// Stop delivering frames for the named request.
    fn release(&self, name: &str);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn register(&self, handler: FrameHandler) {
        (**self).register(handler)
    }

    fn send(
        &self,
        kind: FrameKind,
        rate: RateHint,
        sequence: u16,
        payload: &[u8],
        name: &str,
    ) -> Result<(), TransportError> {
        (**self).send(kind, rate, sequence, payload, name)
    }

    fn release(&self, name: &str) {
        (**self).release(name)
    }
}

pub(crate) fn check_name(name: &str) -> Result<(), TransportError> {
    if name.len() > MAX_NAME_LEN {
        return Err(TransportError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}
