//! Envelope codec
//!
//! Maps the message model in [`super::message`] onto the tag/varint wire
//! format from [`super::wire`]. Unknown fields are skipped, fields that
//! arrive with an unexpected wire type are treated as unknown, and absent
//! fields decode to `None`.

use super::message::*;
use super::wire::{CodecError, FieldHeader, Reader, WireType, Writer};

/// A message that knows its own field layout.
pub trait WireMessage: Default {
    /// Write every present field.
    fn encode_fields(&self, w: &mut Writer);

    /// Absorb one field. Return `Ok(false)` if the field is not modelled
    /// (or has the wrong wire type) so the caller skips it.
    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError>;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_fields(&mut w);
        w.into_vec()
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        Self::decode_from(&mut Reader::new(buf))
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let mut message = Self::default();
        while let Some(header) = r.read_header()? {
            if !message.merge_field(header, r)? {
                r.skip(header)?;
            }
        }
        Ok(message)
    }
}

/// Encode one envelope into a standalone frame.
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

/// Decode one frame. Errors reject only this frame.
pub fn decode_envelope(buf: &[u8]) -> Result<Envelope, CodecError> {
    Envelope::decode(buf)
}

fn nested<M: WireMessage>(r: &mut Reader<'_>) -> Result<M, CodecError> {
    M::decode_from(&mut r.read_nested()?)
}

fn put_message<M: WireMessage>(w: &mut Writer, field: u32, message: &M) {
    w.write_message(field, |inner| message.encode_fields(inner));
}

macro_rules! expect_type {
    ($header:expr, $wire:expr) => {
        if $header.wire_type != $wire {
            return Ok(false);
        }
    };
}

impl WireMessage for Envelope {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(to) = &self.to {
            w.write_string(1, to);
        }
        if let Some(from) = &self.from {
            w.write_string(2, from);
        }
        match &self.payload {
            None => {}
            Some(Payload::Signal(m)) => put_message(w, 3, m),
            Some(Payload::Init(m)) => put_message(w, 4, m),
            Some(Payload::Response(m)) => put_message(w, 5, m),
            Some(Payload::SegmentRequest(m)) => put_message(w, 6, m),
            Some(Payload::SegmentResponse(m)) => put_message(w, 7, m),
            Some(Payload::RecordRequest(m)) => put_message(w, 8, m),
            Some(Payload::RecordResponse(m)) => put_message(w, 9, m),
            Some(Payload::UserConfig(m)) => put_message(w, 10, m),
            Some(Payload::TriggerRefresh) => w.write_message(11, |_| {}),
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        expect_type!(header, WireType::LengthDelimited);
        match header.field {
            1 => self.to = Some(r.read_string()?),
            2 => self.from = Some(r.read_string()?),
            3 => self.payload = Some(Payload::Signal(nested(r)?)),
            4 => self.payload = Some(Payload::Init(nested(r)?)),
            5 => self.payload = Some(Payload::Response(nested(r)?)),
            6 => self.payload = Some(Payload::SegmentRequest(nested(r)?)),
            7 => self.payload = Some(Payload::SegmentResponse(nested(r)?)),
            8 => self.payload = Some(Payload::RecordRequest(nested(r)?)),
            9 => self.payload = Some(Payload::RecordResponse(nested(r)?)),
            10 => self.payload = Some(Payload::UserConfig(nested(r)?)),
            11 => {
                r.read_bytes()?;
                self.payload = Some(Payload::TriggerRefresh);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Signal {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(stream_id) = &self.stream_id {
            w.write_string(1, stream_id);
        }
        if let Some(data) = &self.data {
            w.write_string(2, data);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        expect_type!(header, WireType::LengthDelimited);
        match header.field {
            1 => self.stream_id = Some(r.read_string()?),
            2 => self.data = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Init {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(id) = &self.id {
            w.write_string(1, id);
        }
        if let Some(is_user) = self.is_user {
            w.write_bool(2, is_user);
        }
        if let Some(token) = &self.token {
            w.write_string(3, token);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (1, WireType::LengthDelimited) => self.id = Some(r.read_string()?),
            (2, WireType::Varint) => self.is_user = Some(r.read_bool()?),
            (3, WireType::LengthDelimited) => self.token = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Response {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(message) = &self.message {
            w.write_string(1, message);
        }
        if let Some(success) = self.success {
            w.write_bool(2, success);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (1, WireType::LengthDelimited) => self.message = Some(r.read_string()?),
            (2, WireType::Varint) => self.success = Some(r.read_bool()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for SegmentRequest {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(file_name) = &self.file_name {
            w.write_string(2, file_name);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (2, WireType::LengthDelimited) => self.file_name = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for SegmentResponse {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(data) = &self.data {
            w.write_bytes(1, data);
        }
        if let Some(file_name) = &self.file_name {
            w.write_string(2, file_name);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        expect_type!(header, WireType::LengthDelimited);
        match header.field {
            1 => self.data = Some(r.read_bytes()?.to_vec()),
            2 => self.file_name = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for RecordRequest {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(id) = self.id {
            w.write_int64(1, id);
        }
        if let Some(start_time) = self.start_time {
            w.write_int64(2, start_time);
        }
        if let Some(end_time) = self.end_time {
            w.write_int64(3, end_time);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        expect_type!(header, WireType::Varint);
        match header.field {
            1 => self.id = Some(r.read_int64()?),
            2 => self.start_time = Some(r.read_int64()?),
            3 => self.end_time = Some(r.read_int64()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for RecordResponse {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(id) = self.id {
            w.write_int64(1, id);
        }
        for record in &self.records {
            put_message(w, 2, record);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (1, WireType::Varint) => self.id = Some(r.read_int64()?),
            (2, WireType::LengthDelimited) => self.records.push(nested(r)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for VideoRange {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(start_time) = self.start_time {
            w.write_int64(1, start_time);
        }
        if let Some(end_time) = self.end_time {
            w.write_int64(2, end_time);
        }
        if let Some(file_name) = &self.file_name {
            w.write_string(3, file_name);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (1, WireType::Varint) => self.start_time = Some(r.read_int64()?),
            (2, WireType::Varint) => self.end_time = Some(r.read_int64()?),
            (3, WireType::LengthDelimited) => self.file_name = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for UserConfig {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(recording_type) = self.recording_type {
            w.write_int32(1, recording_type.as_i32());
        }
        for schedule in &self.schedules {
            put_message(w, 2, schedule);
        }
        if let Some(motion_config) = &self.motion_config {
            put_message(w, 3, motion_config);
        }
        if let Some(motion_enabled) = self.motion_enabled {
            w.write_bool(4, motion_enabled);
        }
        if let Some(name) = &self.name {
            w.write_string(5, name);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (1, WireType::Varint) => {
                self.recording_type = Some(RecordingType::from_i32(r.read_int32()?))
            }
            (2, WireType::LengthDelimited) => self.schedules.push(nested(r)?),
            (3, WireType::LengthDelimited) => self.motion_config = Some(nested(r)?),
            (4, WireType::Varint) => self.motion_enabled = Some(r.read_bool()?),
            (5, WireType::LengthDelimited) => self.name = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for Schedule {
    fn encode_fields(&self, w: &mut Writer) {
        w.write_packed_int32(1, &self.days_of_week);
        if let Some(start_time) = &self.start_time {
            w.write_string(2, start_time);
        }
        if let Some(end_time) = &self.end_time {
            w.write_string(3, end_time);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match (header.field, header.wire_type) {
            (1, WireType::LengthDelimited | WireType::Varint) => {
                r.read_repeated_int32(header.wire_type, &mut self.days_of_week)?
            }
            (2, WireType::LengthDelimited) => self.start_time = Some(r.read_string()?),
            (3, WireType::LengthDelimited) => self.end_time = Some(r.read_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl WireMessage for MotionConfig {
    fn encode_fields(&self, w: &mut Writer) {
        if let Some(sensitivity) = self.sensitivity {
            w.write_int32(1, sensitivity);
        }
        if let Some(pre) = self.pre_record_seconds {
            w.write_int32(2, pre);
        }
        if let Some(post) = self.post_record_seconds {
            w.write_int32(3, post);
        }
    }

    fn merge_field(&mut self, header: FieldHeader, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        expect_type!(header, WireType::Varint);
        match header.field {
            1 => self.sensitivity = Some(r.read_int32()?),
            2 => self.pre_record_seconds = Some(r.read_int32()?),
            3 => self.post_record_seconds = Some(r.read_int32()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}
