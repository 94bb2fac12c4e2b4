//! Inbound side of the OBEX protocol.

use std::sync::Arc;

use super::frame::{hex, ObexFrame};
use super::wire_format::{declared_length, Opcode, PREFIX_SIZE};
use crate::error::{ModemError, Result};
use crate::link::{Consumed, Delivery, LinkBuffer, ProtocolHandler, ResponseSlot};

/// Slot keyed by the opcode of the outstanding request.
pub(crate) type ObexSlot = ResponseSlot<Opcode, Result<ObexFrame>>;

/// Takes complete OBEX responses off the link while in OBEX mode.
///
/// Responses are decoded against the opcode of the outstanding request, so a
/// CONNECT response is read with its preamble. Decode failures are delivered
/// to the waiting caller as [`ModemError::InvalidFrame`].
pub struct ObexHandler {
    slot: Arc<ObexSlot>,
}

impl ObexHandler {
    pub(crate) fn new(slot: Arc<ObexSlot>) -> Self {
        Self { slot }
    }

    fn offer(&self, raw: &[u8], build: impl FnOnce(Opcode) -> Result<ObexFrame>) {
        match self.slot.deliver_with(|request| Some(build(*request))) {
            Delivery::Delivered => {}
            _ => tracing::warn!(
                "Dropping unsolicited OBEX response: {}",
                hex(&raw[..raw.len().min(32)])
            ),
        }
    }
}

impl ProtocolHandler for ObexHandler {
    fn name(&self) -> &'static str {
        "OBEX"
    }

    fn claims(&self, _pending: &[u8]) -> bool {
        // Only registered for OBEX mode, where every byte is frame data.
        true
    }

    fn consume(&self, buffer: &mut LinkBuffer) -> Consumed {
        let Some(declared) = declared_length(buffer.peek()) else {
            return Consumed::Incomplete;
        };

        if declared < PREFIX_SIZE {
            let raw = buffer.take_all();
            self.offer(&raw, |_| {
                Err(ModemError::InvalidFrame(format!(
                    "declared frame length {} is shorter than the prefix",
                    declared
                )))
            });
            return Consumed::UNIT;
        }
        if buffer.len() < declared {
            return Consumed::Incomplete;
        }

        let raw = buffer.split_to(declared);
        tracing::trace!("OBEX <- {}", hex(&raw));
        self.offer(&raw, |request| ObexFrame::decode_response(&raw, request));
        Consumed::UNIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obex::{ObexHeader, ResponseCode};
    use bytes::Bytes;
    use std::time::Duration;

    fn handler() -> (ObexHandler, Arc<ObexSlot>) {
        let slot = Arc::new(ObexSlot::new());
        (ObexHandler::new(slot.clone()), slot)
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (handler, slot) = handler();
        let pending = slot.arm(Opcode::GetFinal);
        let bytes = ObexFrame::response(ResponseCode::Success)
            .with_header(ObexHeader::EndOfBody(Bytes::from_static(b"data")))
            .encode()
            .unwrap();

        let mut buffer = LinkBuffer::new();
        buffer.extend(&bytes[..4]);
        assert_eq!(handler.consume(&mut buffer), Consumed::Incomplete);
        buffer.extend(&bytes[4..]);
        assert_eq!(handler.consume(&mut buffer), Consumed::UNIT);
        assert!(buffer.is_empty());

        let frame = pending
            .wait(Duration::from_millis(50), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.body().map(|b| &b[..]), Some(&b"data"[..]));
    }

    #[tokio::test]
    async fn test_connect_response_decoded_with_preamble() {
        let (handler, slot) = handler();
        let pending = slot.arm(Opcode::Connect);

        let mut buffer = LinkBuffer::new();
        buffer.extend(&[0xA0, 0x00, 0x07, 0x10, 0x00, 0x04, 0x00]);
        handler.consume(&mut buffer);

        let frame = pending
            .wait(Duration::from_millis(50), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.response_code(), Some(ResponseCode::Success));
    }

    #[tokio::test]
    async fn test_short_length_delivers_error() {
        let (handler, slot) = handler();
        let pending = slot.arm(Opcode::Get);

        let mut buffer = LinkBuffer::new();
        buffer.extend(&[0xA0, 0x00, 0x01, 0x55]);
        assert_eq!(handler.consume(&mut buffer), Consumed::UNIT);
        assert!(buffer.is_empty());

        let result = pending.wait(Duration::from_millis(50), 1).await.unwrap();
        assert!(matches!(result, Err(ModemError::InvalidFrame(_))));
    }

    #[test]
    fn test_unsolicited_frame_consumed() {
        let (handler, slot) = handler();
        let mut buffer = LinkBuffer::new();
        buffer.extend(&[0xA0, 0x00, 0x03, 0xA0]);

        assert_eq!(handler.consume(&mut buffer), Consumed::UNIT);
        assert_eq!(buffer.peek(), &[0xA0]);
        assert!(!slot.is_armed());
    }
}
