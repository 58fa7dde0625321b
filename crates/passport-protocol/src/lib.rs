//! Passport Loyalty wire format: header validation, CRC32 integrity, and
//! XML-based message classification.
//!
//! This crate is transport-agnostic — it knows how to interpret bytes
//! already in hand, never how to read them off a socket. The async framed
//! reader lives in the `pos-proxy` binary crate, which composes
//! [`decode_header`] with its own `read_exact`.

use crc::{CRC_32_ISO_HDLC, Crc};
use thiserror::Error;

pub const HEADER_LEN: usize = 28;
pub const SIGNATURE: &[u8; 10] = b"POSLOYALTY";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Sentinel `POSSequenceID` reported for binary echo frames, which carry
/// no XML payload to read one from.
pub const ECHO_SEQUENCE_ID: &str = "PASSPORT_ECHO";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed Passport header: {0}")]
    MalformedHeader(String),
    #[error("malformed Passport frame: {0}")]
    MalformedFrame(String),
}

/// Routing classification for a decoded Passport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingMode {
    CardUnicast,
    SessionUnicast,
    DefaultUnicast,
    MulticastWithResponse,
    MulticastNoResponse,
}

/// Result of [`classify`]: the handling mode plus whatever routing
/// identifiers the message carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub mode: HandlingMode,
    pub routing_key: Option<String>,
    pub session_id: Option<String>,
}

/// The decoded header of a Passport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_kind: u32,
    pub payload_length: u32,
    pub payload_crc32: u32,
    pub header_crc32: u32,
}

/// Validate and decode a 28-byte Passport header.
///
/// Checks the signature, the reserved bytes, the message kind, and the
/// header CRC. Does not touch the payload.
pub fn decode_header(bytes: &[u8]) -> Result<Header, CodecError> {
    if bytes.len() != HEADER_LEN {
        return Err(CodecError::MalformedHeader(format!(
            "expected {HEADER_LEN} header bytes, got {}",
            bytes.len()
        )));
    }
    if &bytes[0..10] != SIGNATURE {
        return Err(CodecError::MalformedHeader(
            "signature is not POSLOYALTY".to_owned(),
        ));
    }
    if bytes[10] != 0 || bytes[11] != 0 {
        return Err(CodecError::MalformedHeader(
            "reserved bytes are not zero".to_owned(),
        ));
    }
    let message_kind = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    if message_kind != 1 && message_kind != 2 {
        return Err(CodecError::MalformedHeader(format!(
            "invalid message_kind {message_kind}"
        )));
    }
    let payload_length = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let payload_crc32 = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
    let header_crc32 = u32::from_le_bytes(bytes[24..28].try_into().unwrap());

    let computed = CRC32.checksum(&bytes[0..24]);
    if header_crc32 != computed {
        return Err(CodecError::MalformedHeader(format!(
            "header CRC mismatch: expected {header_crc32:#010x}, computed {computed:#010x}"
        )));
    }

    Ok(Header {
        message_kind,
        payload_length,
        payload_crc32,
        header_crc32,
    })
}

/// Re-validate a complete frame (header + payload), including the
/// payload CRC when the frame declares one (`payload_crc32 != 0`).
pub fn verify(frame: &[u8]) -> Result<Header, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::MalformedFrame(
            "frame shorter than header".to_owned(),
        ));
    }
    let header = decode_header(&frame[0..HEADER_LEN])?;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != header.payload_length as usize {
        return Err(CodecError::MalformedFrame(format!(
            "declared payload length {} does not match {} bytes present",
            header.payload_length,
            payload.len()
        )));
    }
    if header.payload_crc32 != 0 {
        let computed = CRC32.checksum(payload);
        if computed != header.payload_crc32 {
            return Err(CodecError::MalformedFrame(format!(
                "payload CRC mismatch: expected {:#010x}, computed {computed:#010x}",
                header.payload_crc32
            )));
        }
    }
    Ok(header)
}

/// True iff the frame is a binary echo/heartbeat (`message_kind == 2`).
pub fn is_binary_echo(frame: &[u8]) -> bool {
    frame.len() >= HEADER_LEN && u32::from_le_bytes(frame[12..16].try_into().unwrap()) == 2
}

fn xml_payload(frame: &[u8]) -> &[u8] {
    &frame[HEADER_LEN..]
}

/// First non-empty text of an element matched by local name, searched
/// depth-first under the document root (matches the reference's
/// `ElementTree.iter()` semantics: namespace-blind, document order).
fn find_element_text<'a>(doc: &'a roxmltree::Document<'a>, local_name: &str) -> Option<&'a str> {
    doc.descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == local_name)
        .find_map(|n| {
            let text = n.text()?.trim();
            if text.is_empty() { None } else { Some(text) }
        })
}

fn has_element(doc: &roxmltree::Document, local_name: &str) -> bool {
    doc.descendants()
        .any(|n| n.is_element() && n.tag_name().name() == local_name)
}

/// Classify a verified frame into a handling mode plus routing
/// identifiers. Callers must have already called [`verify`] — this
/// function re-parses the XML but does not re-check CRCs.
pub fn classify(frame: &[u8]) -> Result<Classification, CodecError> {
    if is_binary_echo(frame) {
        return Ok(Classification {
            mode: HandlingMode::MulticastWithResponse,
            routing_key: None,
            session_id: None,
        });
    }

    let xml_bytes = xml_payload(frame);
    let xml_text = std::str::from_utf8(xml_bytes)
        .map_err(|e| CodecError::MalformedFrame(format!("payload is not valid UTF-8: {e}")))?;
    let doc = roxmltree::Document::parse(xml_text)
        .map_err(|e| CodecError::MalformedFrame(format!("payload is not well-formed XML: {e}")))?;

    if has_element(&doc, "GetLoyaltyOnlineStatusRequest")
        || has_element(&doc, "GetLoyaltyOnlineStatusResponse")
    {
        return Ok(Classification {
            mode: HandlingMode::MulticastWithResponse,
            routing_key: None,
            session_id: None,
        });
    }

    if has_element(&doc, "BeginCustomerRequest") || has_element(&doc, "EndCustomerRequest") {
        return Ok(Classification {
            mode: HandlingMode::MulticastNoResponse,
            routing_key: None,
            session_id: None,
        });
    }

    if let Some(card) = find_element_text(&doc, "LoyaltyID") {
        let session_id = find_element_text(&doc, "LoyaltySequenceID").map(str::to_owned);
        return Ok(Classification {
            mode: HandlingMode::CardUnicast,
            routing_key: Some(card.to_owned()),
            session_id,
        });
    }

    if let Some(session) = find_element_text(&doc, "LoyaltySequenceID") {
        return Ok(Classification {
            mode: HandlingMode::SessionUnicast,
            routing_key: Some(session.to_owned()),
            session_id: Some(session.to_owned()),
        });
    }

    Ok(Classification {
        mode: HandlingMode::DefaultUnicast,
        routing_key: None,
        session_id: None,
    })
}

/// The `POSSequenceID` carried by a frame, or the echo sentinel for
/// binary echoes.
pub fn pos_sequence_id(frame: &[u8]) -> Result<Option<String>, CodecError> {
    if is_binary_echo(frame) {
        return Ok(Some(ECHO_SEQUENCE_ID.to_owned()));
    }
    let xml_bytes = xml_payload(frame);
    let xml_text = std::str::from_utf8(xml_bytes)
        .map_err(|e| CodecError::MalformedFrame(format!("payload is not valid UTF-8: {e}")))?;
    let doc = roxmltree::Document::parse(xml_text)
        .map_err(|e| CodecError::MalformedFrame(format!("payload is not well-formed XML: {e}")))?;
    Ok(find_element_text(&doc, "POSSequenceID").map(str::to_owned))
}

/// True iff `request` and `response` carry the same `POSSequenceID`.
pub fn sequences_match(request: &[u8], response: &[u8]) -> Result<bool, CodecError> {
    Ok(pos_sequence_id(request)? == pos_sequence_id(response)?)
}
