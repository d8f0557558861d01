/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Codec hooks used while replaying.
//!
//! The replay agents never decode business messages. They only need the
//! template id of a recorded message and a way to encode a gap fill; both
//! come from a [`ReplayEncoder`].

use bytes::{Buf, BufMut, BytesMut};
use ironlink_core::message::TemplateId;
use ironlink_core::types::{SeqNum, SessionIdentity};

/// Codec operations the replay agents depend on.
pub trait ReplayEncoder: Send + Sync {
    /// Returns the template id of a recorded message, if it can be read.
    fn template_id(&self, message: &[u8]) -> Option<TemplateId>;

    /// Returns the encoded length of a gap fill.
    fn gap_fill_length(&self) -> usize;

    /// Encodes a gap fill announcing that everything from `begin_seq_no`
    /// up to `new_seq_no - 1` is skipped.
    fn encode_gap_fill(
        &self,
        session: SessionIdentity,
        begin_seq_no: SeqNum,
        new_seq_no: SeqNum,
        buf: &mut BytesMut,
    );
}

/// Length of an SBE message header.
pub const SBE_HEADER_LEN: usize = 8;

/// Encoder for SBE framed messages.
///
/// Every message starts with the SBE header: block length, template id,
/// schema id and schema version, each a little-endian `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbeReplayEncoder {
    schema_id: u16,
    version: u16,
}

impl SbeReplayEncoder {
    /// Block length of the gap fill body: uuid, begin and new sequence number.
    const GAP_FILL_BLOCK_LEN: u16 = 24;

    /// Creates an encoder for one schema.
    #[must_use]
    pub const fn new(schema_id: u16, version: u16) -> Self {
        Self { schema_id, version }
    }

    /// Writes an SBE header.
    pub fn encode_header(&self, template_id: TemplateId, block_length: u16, buf: &mut BytesMut) {
        buf.put_u16_le(block_length);
        buf.put_u16_le(template_id.value());
        buf.put_u16_le(self.schema_id);
        buf.put_u16_le(self.version);
    }

    /// Reads back a gap fill as `(session, begin_seq_no, new_seq_no)`.
    #[must_use]
    pub fn decode_gap_fill(&self, message: &[u8]) -> Option<(SessionIdentity, SeqNum, SeqNum)> {
        if self.template_id(message) != Some(TemplateId::GAP_FILL)
            || message.len() < SBE_HEADER_LEN + usize::from(Self::GAP_FILL_BLOCK_LEN)
        {
            return None;
        }
        let mut body = &message[SBE_HEADER_LEN..];
        let session = SessionIdentity::new(body.get_u64_le());
        let begin = SeqNum::new(body.get_u64_le());
        let new_seq_no = SeqNum::new(body.get_u64_le());
        Some((session, begin, new_seq_no))
    }
}

impl Default for SbeReplayEncoder {
    fn default() -> Self {
        Self::new(8, 5)
    }
}

impl ReplayEncoder for SbeReplayEncoder {
    fn template_id(&self, message: &[u8]) -> Option<TemplateId> {
        if message.len() < SBE_HEADER_LEN {
            return None;
        }
        let mut header = &message[2..4];
        Some(TemplateId(header.get_u16_le()))
    }

    fn gap_fill_length(&self) -> usize {
        SBE_HEADER_LEN + usize::from(Self::GAP_FILL_BLOCK_LEN)
    }

    fn encode_gap_fill(
        &self,
        session: SessionIdentity,
        begin_seq_no: SeqNum,
        new_seq_no: SeqNum,
        buf: &mut BytesMut,
    ) {
        self.encode_header(TemplateId::GAP_FILL, Self::GAP_FILL_BLOCK_LEN, buf);
        buf.put_u64_le(session.uuid());
        buf.put_u64_le(begin_seq_no.value());
        buf.put_u64_le(new_seq_no.value());
    }
}
