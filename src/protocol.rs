use crate::{
    error::{BikeError, Result},
    types::WorkoutTelemetry,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::SystemTime;

/// First byte of every packet in both directions
pub const HEADER: u8 = 0xF9;

/// Size of every multi-packet response frame
pub const PACKET_SIZE: usize = 20;

/// Offset of the payload inside a response frame
pub const PAYLOAD_OFFSET: usize = 4;

/// Payload size of a response frame
pub const PAYLOAD_SIZE: usize = 16;

/// Size of the reassembled workout record (`E5 ‖ E6 ‖ E7`)
pub const WORKOUT_RECORD_SIZE: usize = 3 * PAYLOAD_SIZE;

/// Size of the reassembled hold record (`E1 ‖ E2`)
pub const HOLD_RECORD_SIZE: usize = 2 * PAYLOAD_SIZE;

/// Acknowledgement the bike echoes for a connect request
pub const CONNECT_ACK: [u8; 4] = [0xF9, 0xE0, 0x00, 0xD9];

/// Op-codes of packets written to the bike
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCode {
    /// Start a command session
    Connect = 0xD0,
    /// Keep-alive
    Hold = 0xD1,
    /// First diagnostic exchange
    Info1 = 0xD3,
    /// Second diagnostic exchange
    Info2 = 0xD4,
    /// Request a workout sample
    Workout = 0xD5,
}

/// Op-codes of packets notified by the bike
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// Connect acknowledgement
    ConnectAck = 0xE0,
    /// First half of the hold response
    Hold1 = 0xE1,
    /// Second half of the hold response
    Hold2 = 0xE2,
    /// First diagnostic response
    Info1 = 0xE3,
    /// Second diagnostic response
    Info2 = 0xE4,
    /// First third of a workout record
    Workout1 = 0xE5,
    /// Second third of a workout record
    Workout2 = 0xE6,
    /// Last third of a workout record
    Workout3 = 0xE7,
}

impl ResponseCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xE0 => Some(Self::ConnectAck),
            0xE1 => Some(Self::Hold1),
            0xE2 => Some(Self::Hold2),
            0xE3 => Some(Self::Info1),
            0xE4 => Some(Self::Info2),
            0xE5 => Some(Self::Workout1),
            0xE6 => Some(Self::Workout2),
            0xE7 => Some(Self::Workout3),
            _ => None,
        }
    }
}

/// Wrapping byte sum used as the trailing checksum of request packets
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame a request: header, op-code, body length, body, checksum
#[must_use]
pub fn encode_request(code: RequestCode, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_u8(HEADER);
    buf.put_u8(code as u8);
    buf.put_u8(u8::try_from(body.len()).unwrap_or(u8::MAX));
    buf.extend_from_slice(body);
    let sum = checksum(&buf);
    buf.put_u8(sum);
    buf.freeze()
}

/// Outcome of feeding one notification to a command
#[derive(Debug)]
pub enum Progress<T> {
    /// More packets are needed
    Pending,
    /// The command is resolved, successfully or not
    Done(Result<T>),
}

/// One request/response exchange with the bike
///
/// A command produces the request bytes to write and consumes notification
/// payloads until it can produce its output. It is driven by
/// [`crate::transaction::CommandEngine::execute`].
pub trait Command: Send + 'static {
    /// Value produced when the exchange succeeds
    type Output: Send + 'static;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Request packet to transmit
    fn request(&self) -> Bytes;

    /// Feed one notification payload
    fn receive(&mut self, data: &[u8]) -> Progress<Self::Output>;

    /// Resolution when the request could not be written
    ///
    /// # Errors
    ///
    /// Returns the write error unless the command defines its own outcome.
    fn send_failed(&mut self, error: BikeError) -> Result<Self::Output> {
        Err(error)
    }
}

/// Validate a response frame and return its op-code
fn frame_code(data: &[u8]) -> Result<u8> {
    if data.len() != PACKET_SIZE {
        return Err(BikeError::Protocol(format!(
            "Short packet received from bike: {} bytes, expected {PACKET_SIZE}",
            data.len()
        )));
    }
    if data[0] != HEADER {
        return Err(BikeError::Protocol(format!(
            "Unexpected header byte {:02X}",
            data[0]
        )));
    }
    Ok(data[1])
}

/// Collects the payloads of a fixed set of response frames
#[derive(Debug)]
struct Assembler<const N: usize> {
    codes: [ResponseCode; N],
    slots: [Option<[u8; PAYLOAD_SIZE]>; N],
}

impl<const N: usize> Assembler<N> {
    fn new(codes: [ResponseCode; N]) -> Self {
        Self {
            codes,
            slots: [None; N],
        }
    }

    /// Store the payload of a frame and return the slot it landed in
    fn accept(&mut self, data: &[u8]) -> Result<usize> {
        let code = frame_code(data)?;
        let index = self
            .codes
            .iter()
            .position(|c| *c as u8 == code)
            .ok_or_else(|| BikeError::Protocol(format!("Unexpected op-code {code:02X}")))?;

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_SIZE]);
        self.slots[index] = Some(payload);
        Ok(index)
    }

    fn is_missing_any_before(&self, index: usize) -> bool {
        self.slots[..index].iter().any(Option::is_none)
    }

    /// Concatenate the payloads in op-code order once every slot is filled
    fn assemble(&self) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(N * PAYLOAD_SIZE);
        for slot in &self.slots {
            buf.extend_from_slice(slot.as_ref()?);
        }
        Some(buf.freeze())
    }
}

/// Opens a command session; resolves `true` when the bike echoes [`CONNECT_ACK`]
#[derive(Debug, Default)]
pub struct ConnectCommand;

impl Command for ConnectCommand {
    type Output = bool;

    fn name(&self) -> &'static str {
        "connect"
    }

    fn request(&self) -> Bytes {
        encode_request(RequestCode::Connect, &[])
    }

    fn receive(&mut self, data: &[u8]) -> Progress<bool> {
        if data == CONNECT_ACK {
            Progress::Done(Ok(true))
        } else {
            Progress::Done(Err(BikeError::Protocol(format!(
                "Unexpected connect response {data:02X?}"
            ))))
        }
    }

    fn send_failed(&mut self, _error: BikeError) -> Result<bool> {
        Ok(false)
    }
}

/// Requests one workout sample
///
/// The bike answers with three frames `E5`, `E6`, `E7`. They may arrive in
/// any order, except that `E7` must not arrive while either predecessor is
/// still missing.
#[derive(Debug)]
pub struct WorkoutCommand {
    start: bool,
    frames: Assembler<3>,
}

impl WorkoutCommand {
    /// Create a workout poll; `start` is set on the first poll of a session
    #[must_use]
    pub fn new(start: bool) -> Self {
        Self {
            start,
            frames: Assembler::new([
                ResponseCode::Workout1,
                ResponseCode::Workout2,
                ResponseCode::Workout3,
            ]),
        }
    }

    /// Whether this is the session-opening poll
    #[must_use]
    pub const fn is_start(&self) -> bool {
        self.start
    }
}

impl Command for WorkoutCommand {
    type Output = WorkoutTelemetry;

    fn name(&self) -> &'static str {
        if self.start {
            "workout-start"
        } else {
            "workout"
        }
    }

    fn request(&self) -> Bytes {
        let mut body = [0u8; 13];
        body[0] = u8::from(self.start);
        encode_request(RequestCode::Workout, &body)
    }

    fn receive(&mut self, data: &[u8]) -> Progress<WorkoutTelemetry> {
        let index = match self.frames.accept(data) {
            Ok(index) => index,
            Err(e) => return Progress::Done(Err(e)),
        };

        if index == 2 && self.frames.is_missing_any_before(2) {
            return Progress::Done(Err(BikeError::Protocol(
                "Out of sync result from bike".to_string(),
            )));
        }

        match self.frames.assemble() {
            Some(record) => {
                let mut fixed = [0u8; WORKOUT_RECORD_SIZE];
                fixed.copy_from_slice(&record);
                Progress::Done(Ok(parse_workout_record(&fixed)))
            }
            None => Progress::Pending,
        }
    }
}

/// Keep-alive; resolves with the raw 32-byte `E1 ‖ E2` record
#[derive(Debug)]
pub struct HoldCommand {
    frames: Assembler<2>,
}

impl HoldCommand {
    /// Create a hold command
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Assembler::new([ResponseCode::Hold1, ResponseCode::Hold2]),
        }
    }
}

impl Default for HoldCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for HoldCommand {
    type Output = [u8; HOLD_RECORD_SIZE];

    fn name(&self) -> &'static str {
        "hold"
    }

    fn request(&self) -> Bytes {
        encode_request(RequestCode::Hold, &[0x02, 0x00, 0x00, 0x00, 0x00])
    }

    fn receive(&mut self, data: &[u8]) -> Progress<Self::Output> {
        if let Err(e) = self.frames.accept(data) {
            return Progress::Done(Err(e));
        }

        match self.frames.assemble() {
            Some(record) => {
                let mut out = [0u8; HOLD_RECORD_SIZE];
                out.copy_from_slice(&record);
                Progress::Done(Ok(out))
            }
            None => Progress::Pending,
        }
    }
}

/// First diagnostic exchange; resolves with the undecoded byte 4 of the `E3` frame
#[derive(Debug, Default)]
pub struct Info1Command;

impl Command for Info1Command {
    type Output = u8;

    fn name(&self) -> &'static str {
        "info1"
    }

    fn request(&self) -> Bytes {
        encode_request(
            RequestCode::Info1,
            &[
                0x01, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x3C, 0x00, 0xA0, 0x00, 0x00, 0x00, 0x00,
            ],
        )
    }

    fn receive(&mut self, data: &[u8]) -> Progress<u8> {
        Progress::Done(expect_frame(data, ResponseCode::Info1).map(|frame| frame[PAYLOAD_OFFSET]))
    }
}

/// Second diagnostic exchange; resolves with big-endian bytes 4..6 of the `E4` frame
#[derive(Debug, Default)]
pub struct Info2Command;

impl Command for Info2Command {
    type Output = u16;

    fn name(&self) -> &'static str {
        "info2"
    }

    fn request(&self) -> Bytes {
        let mut body = [0u8; 15];
        body[0] = 0x02;
        body[13] = 0x1F;
        body[14] = 0x0F;
        encode_request(RequestCode::Info2, &body)
    }

    fn receive(&mut self, data: &[u8]) -> Progress<u16> {
        Progress::Done(expect_frame(data, ResponseCode::Info2).map(|frame| {
            let mut buf = &frame[PAYLOAD_OFFSET..];
            buf.get_u16()
        }))
    }
}

fn expect_frame(data: &[u8], expected: ResponseCode) -> Result<&[u8]> {
    let code = frame_code(data)?;
    if code != expected as u8 {
        return Err(BikeError::Protocol(format!(
            "Unexpected op-code {code:02X}, expected {:02X}",
            expected as u8
        )));
    }
    Ok(data)
}

/// Decode a reassembled workout record, stamping it with the current time
#[must_use]
pub fn parse_workout_record(record: &[u8; WORKOUT_RECORD_SIZE]) -> WorkoutTelemetry {
    parse_workout_record_at(record, SystemTime::now())
}

/// Decode a reassembled workout record
///
/// Record layout (big-endian):
/// - Byte 0: second-of-minute
/// - Bytes 1-2: distance (divide by 100.0 for miles)
/// - Bytes 3-4: elapsed workout seconds
/// - Bytes 7-8: speed (divide by 10.0 for mph)
/// - Bytes 10-11: cadence (rpm)
/// - Byte 20: speed level (0..=9)
/// - Bytes 30, 31: undecoded
#[must_use]
pub fn parse_workout_record_at(
    record: &[u8; WORKOUT_RECORD_SIZE],
    timestamp: SystemTime,
) -> WorkoutTelemetry {
    let mut buf = &record[..];

    let second = buf.get_u8();
    let distance_miles = f64::from(buf.get_u16()) / 100.0;
    let duration_secs = buf.get_u16();
    buf.advance(2);
    let speed_mph = f64::from(buf.get_u16()) / 10.0;
    buf.advance(1);
    let rpm = buf.get_u16();

    WorkoutTelemetry {
        timestamp,
        second,
        distance_miles,
        duration_secs,
        speed_mph,
        rpm,
        speed_level: record[20],
        diag1: record[30],
        diag2: record[31],
    }
}
