//! # Modbus Codec
//!
//! Request PDU encoding and reply PDU decoding for the supported functions.
//!
//! | FC | Request | Reply |
//! |----|---------|-------|
//! | 0x01 / 0x02 | start, count | byte count, packed bits |
//! | 0x03 / 0x04 | start, count | byte count, registers |
//! | 0x05 | address, 0xFF00 / 0x0000 | echo |
//! | 0x06 | address, value | echo |
//! | 0x0F | start, count, byte count, packed bits | start, count |
//! | 0x10 | start, count, byte count, registers | start, count |
//!
//! A reply whose function code is `fc | 0x80` carries a single exception byte
//! and decodes to [`ModbusError::Exception`].

use crate::error::{FrameError, ModbusError, ModbusResult};
use crate::iter::{BitIterator, RegisterIterator};
use crate::pdu::{coil_from_u16, packed_len, ModbusPdu, PduBuilder, PduCursor};
use crate::protocol::{AddressRange, Indexed, ModbusFunction};
use crate::request::RequestDetails;

/// Encode the PDU of a request
pub(crate) fn encode_request(details: &RequestDetails) -> ModbusResult<ModbusPdu> {
    match details {
        RequestDetails::ReadBits {
            function, range, ..
        }
        | RequestDetails::ReadRegisters {
            function, range, ..
        } => PduBuilder::build_read_request(*function, *range),
        RequestDetails::WriteSingleCoil { value, .. } => {
            PduBuilder::build_write_single_coil(value.index, value.value)
        }
        RequestDetails::WriteSingleRegister { value, .. } => {
            PduBuilder::build_write_single_register(value.index, value.value)
        }
        RequestDetails::WriteMultipleCoils { write, .. } => {
            PduBuilder::build_write_multiple_coils(write)
        }
        RequestDetails::WriteMultipleRegisters { write, .. } => {
            PduBuilder::build_write_multiple_registers(write)
        }
    }
}

/// Check the function code of a reply and position a cursor after it
///
/// An exception reply is turned into `ModbusError::Exception`.
pub fn parse_reply_header(function: ModbusFunction, pdu: &[u8]) -> ModbusResult<PduCursor<'_>> {
    let mut cursor = PduCursor::new(pdu);
    let code = cursor.read_u8()?;

    if code == function.to_u8() {
        return Ok(cursor);
    }

    if code == function.exception_code() {
        let exception = cursor.read_u8()?;
        cursor.expect_empty()?;
        return Err(ModbusError::exception(exception));
    }

    Err(FrameError::UnexpectedFunction {
        expected: function.to_u8(),
        actual: code,
    }
    .into())
}

/// Decode an FC01/FC02 reply into a bit cursor over the reply buffer
pub fn parse_read_bits(
    function: ModbusFunction,
    range: AddressRange,
    pdu: &[u8],
) -> ModbusResult<BitIterator<'_>> {
    let mut cursor = parse_reply_header(function, pdu)?;
    let bytes = cursor.read_counted()?;
    cursor.expect_empty()?;

    let expected = packed_len(range.count);
    if bytes.len() != expected {
        return Err(FrameError::ByteCountMismatch {
            expected,
            actual: bytes.len(),
        }
        .into());
    }

    Ok(BitIterator::new(range, bytes))
}

/// Decode an FC03/FC04 reply into a register cursor over the reply buffer
pub fn parse_read_registers(
    function: ModbusFunction,
    range: AddressRange,
    pdu: &[u8],
) -> ModbusResult<RegisterIterator<'_>> {
    let mut cursor = parse_reply_header(function, pdu)?;
    let bytes = cursor.read_counted()?;
    cursor.expect_empty()?;

    let expected = usize::from(range.count) * 2;
    if bytes.len() != expected {
        return Err(FrameError::ByteCountMismatch {
            expected,
            actual: bytes.len(),
        }
        .into());
    }

    Ok(RegisterIterator::new(range, bytes))
}

/// Decode an FC05 reply, which must echo the request
pub fn parse_write_single_coil(request: Indexed<bool>, pdu: &[u8]) -> ModbusResult<()> {
    let mut cursor = parse_reply_header(ModbusFunction::WriteSingleCoil, pdu)?;
    let address = cursor.read_u16_be()?;
    let value = coil_from_u16(cursor.read_u16_be()?)?;
    cursor.expect_empty()?;

    if address != request.index || value != request.value {
        return Err(FrameError::EchoMismatch.into());
    }
    Ok(())
}

/// Decode an FC06 reply, which must echo the request
pub fn parse_write_single_register(request: Indexed<u16>, pdu: &[u8]) -> ModbusResult<()> {
    let mut cursor = parse_reply_header(ModbusFunction::WriteSingleRegister, pdu)?;
    let address = cursor.read_u16_be()?;
    let value = cursor.read_u16_be()?;
    cursor.expect_empty()?;

    if address != request.index || value != request.value {
        return Err(FrameError::EchoMismatch.into());
    }
    Ok(())
}

/// Decode an FC0F/FC10 reply, which must echo start and quantity
pub fn parse_write_multiple(
    function: ModbusFunction,
    range: AddressRange,
    pdu: &[u8],
) -> ModbusResult<()> {
    let mut cursor = parse_reply_header(function, pdu)?;
    let start = cursor.read_u16_be()?;
    let count = cursor.read_u16_be()?;
    cursor.expect_empty()?;

    if start != range.start || count != range.count {
        return Err(FrameError::EchoMismatch.into());
    }
    Ok(())
}
