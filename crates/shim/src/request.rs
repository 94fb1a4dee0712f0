//! Transfer request building
//!
//! Turns a libusb transfer into the request record the platform binding
//! accepts. OUT transfers carry a copy of their data; IN transfers carry
//! only the requested length and receive their bytes at completion time.
//! Control transfers take their setup fields from the 8 byte setup block
//! at the start of the buffer.

use crate::error::LibusbError;
use crate::transfer::TransferFields;
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;
use usb_binding::{ControlTransferInfo, Direction, GenericTransferInfo, Recipient, RequestType};

/// Direction bit of an endpoint address or `bmRequestType`
pub const ENDPOINT_DIR_MASK: u8 = 0x80;
const RECIPIENT_MASK: u8 = 0x03;
const REQUEST_TYPE_MASK: u8 = 0x60;

/// Control setup block at the head of a control transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl ControlSetup {
    pub const SIZE: usize = 8;

    /// Read the setup block from the first 8 bytes of `buffer`
    pub fn parse(buffer: &[u8]) -> Option<Self> {
        if buffer.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            bm_request_type: buffer[0],
            b_request: buffer[1],
            w_value: LittleEndian::read_u16(&buffer[2..4]),
            w_index: LittleEndian::read_u16(&buffer[4..6]),
            w_length: LittleEndian::read_u16(&buffer[6..8]),
        })
    }

    /// Write the setup block into the first 8 bytes of `buffer`
    ///
    /// # Panics
    /// When `buffer` is shorter than 8 bytes.
    pub fn write(&self, buffer: &mut [u8]) {
        buffer[0] = self.bm_request_type;
        buffer[1] = self.b_request;
        LittleEndian::write_u16(&mut buffer[2..4], self.w_value);
        LittleEndian::write_u16(&mut buffer[4..6], self.w_index);
        LittleEndian::write_u16(&mut buffer[6..8], self.w_length);
    }

    pub fn direction(&self) -> Direction {
        direction_of(self.bm_request_type)
    }

    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self.bm_request_type & REQUEST_TYPE_MASK {
            0x00 => RequestType::Standard,
            0x20 => RequestType::Class,
            0x40 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }
}

/// Fill the setup block of a control transfer buffer
///
/// # Panics
/// When `buffer` is shorter than 8 bytes.
pub fn fill_control_setup(
    buffer: &mut [u8],
    bm_request_type: u8,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
) {
    ControlSetup {
        bm_request_type,
        b_request,
        w_value,
        w_index,
        w_length,
    }
    .write(buffer);
}

/// Direction encoded in bit 7 of an endpoint address or request type
pub fn direction_of(address_or_request_type: u8) -> Direction {
    if address_or_request_type & ENDPOINT_DIR_MASK != 0 {
        Direction::In
    } else {
        Direction::Out
    }
}

/// Build a control request from setup fields and the data stage
///
/// For OUT requests `data` is copied into the request; for IN requests only
/// `w_length` is carried.
pub fn build_control_info(setup: &ControlSetup, data: &[u8], timeout: u32) -> ControlTransferInfo {
    let direction = setup.direction();
    let (length, data) = match direction {
        Direction::In => (Some(setup.w_length), None),
        Direction::Out => (None, Some(data.to_vec())),
    };
    ControlTransferInfo {
        direction,
        recipient: setup.recipient(),
        request_type: setup.request_type(),
        request: setup.b_request,
        value: setup.w_value,
        index: setup.w_index,
        length,
        data,
        timeout,
    }
}

/// Build a bulk or interrupt request
pub fn build_generic_info(endpoint: u8, data: &[u8], timeout: u32) -> GenericTransferInfo {
    let direction = direction_of(endpoint);
    let (length, data) = match direction {
        Direction::In => (Some(data.len() as u32), None),
        Direction::Out => (None, Some(data.to_vec())),
    };
    GenericTransferInfo {
        direction,
        endpoint,
        length,
        data,
        timeout,
    }
}

/// Control request of a submitted transfer
///
/// The transfer length must cover the setup block and match `8 + wLength`
/// exactly, and the buffer must hold `length` bytes; anything else is
/// [`LibusbError::InvalidParam`].
pub fn control_info_from_transfer(
    fields: &TransferFields,
) -> Result<ControlTransferInfo, LibusbError> {
    let buffer = fields.buffer.as_deref().unwrap_or(&[]);
    if fields.length < ControlSetup::SIZE {
        debug!(
            "Control transfer length {} shorter than setup block",
            fields.length
        );
        return Err(LibusbError::InvalidParam);
    }
    if buffer.len() < fields.length {
        debug!(
            "Control transfer buffer of {} bytes shorter than length {}",
            buffer.len(),
            fields.length
        );
        return Err(LibusbError::InvalidParam);
    }
    let setup = ControlSetup::parse(buffer).ok_or(LibusbError::InvalidParam)?;
    if setup.w_length as usize != fields.length - ControlSetup::SIZE {
        debug!(
            "Control transfer wLength {} does not match length {}",
            setup.w_length, fields.length
        );
        return Err(LibusbError::InvalidParam);
    }
    Ok(build_control_info(
        &setup,
        &buffer[ControlSetup::SIZE..fields.length],
        fields.timeout,
    ))
}

/// Bulk or interrupt request of a submitted transfer
pub fn generic_info_from_transfer(
    fields: &TransferFields,
) -> Result<GenericTransferInfo, LibusbError> {
    let buffer = fields.buffer.as_deref().unwrap_or(&[]);
    if buffer.len() < fields.length {
        debug!(
            "Transfer buffer of {} bytes shorter than length {}",
            buffer.len(),
            fields.length
        );
        return Err(LibusbError::InvalidParam);
    }
    Ok(build_generic_info(
        fields.endpoint,
        &buffer[..fields.length],
        fields.timeout,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{Transfer, TransferType};
    use common::test_utils::create_mock_setup_packet;

    fn control_fields(buffer: Vec<u8>, length: usize) -> std::sync::Arc<Transfer> {
        let transfer = Transfer::new();
        {
            let mut fields = transfer.lock();
            fields.transfer_type = TransferType::Control;
            fields.buffer = Some(buffer);
            fields.length = length;
            fields.timeout = 1000;
        }
        transfer
    }

    #[test]
    fn test_setup_parse_little_endian() {
        let raw = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0409, 0x0012);
        let setup = ControlSetup::parse(&raw).unwrap();

        assert_eq!(setup.bm_request_type, 0x80);
        assert_eq!(setup.b_request, 0x06);
        assert_eq!(setup.w_value, 0x0100);
        assert_eq!(setup.w_index, 0x0409);
        assert_eq!(setup.w_length, 0x0012);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.recipient(), Recipient::Device);
        assert_eq!(setup.request_type(), RequestType::Standard);
    }

    #[test]
    fn test_fill_control_setup_matches_raw_layout() {
        let mut buffer = [0u8; 8];
        fill_control_setup(&mut buffer, 0x21, 0x09, 0x0200, 0x0001, 0x0040);
        assert_eq!(
            buffer,
            create_mock_setup_packet(0x21, 0x09, 0x0200, 0x0001, 0x0040)
        );
    }

    #[test]
    fn test_setup_parse_too_short() {
        assert!(ControlSetup::parse(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_recipient_and_request_type_bits() {
        let cases = [
            (0x00, Recipient::Device, RequestType::Standard),
            (0x21, Recipient::Interface, RequestType::Class),
            (0x42, Recipient::Endpoint, RequestType::Vendor),
            (0x63, Recipient::Other, RequestType::Reserved),
        ];
        for (bm_request_type, recipient, request_type) in cases {
            let setup = ControlSetup {
                bm_request_type,
                b_request: 0,
                w_value: 0,
                w_index: 0,
                w_length: 0,
            };
            assert_eq!(setup.recipient(), recipient);
            assert_eq!(setup.request_type(), request_type);
        }
    }

    #[test]
    fn test_control_length_eight_with_wlength_one_rejected() {
        let buffer = create_mock_setup_packet(0x80, 0x06, 0x0100, 0, 1).to_vec();
        let transfer = control_fields(buffer, 8);
        assert_eq!(
            control_info_from_transfer(&transfer.lock()),
            Err(LibusbError::InvalidParam)
        );
    }

    #[test]
    fn test_control_length_nine_with_wlength_one_accepted() {
        let mut buffer = create_mock_setup_packet(0x80, 0x06, 0x0100, 0, 1).to_vec();
        buffer.push(0);
        let transfer = control_fields(buffer, 9);

        let info = control_info_from_transfer(&transfer.lock()).unwrap();
        assert_eq!(info.direction, Direction::In);
        assert_eq!(info.length, Some(1));
        assert_eq!(info.data, None);
        assert_eq!(info.timeout, 1000);
    }

    #[test]
    fn test_control_shorter_than_setup_rejected() {
        let transfer = control_fields(vec![0u8; 4], 4);
        assert_eq!(
            control_info_from_transfer(&transfer.lock()),
            Err(LibusbError::InvalidParam)
        );
    }

    #[test]
    fn test_control_buffer_shorter_than_length_rejected() {
        let buffer = create_mock_setup_packet(0x80, 0x06, 0x0100, 0, 4).to_vec();
        let transfer = control_fields(buffer, 12);
        assert_eq!(
            control_info_from_transfer(&transfer.lock()),
            Err(LibusbError::InvalidParam)
        );
    }

    #[test]
    fn test_control_out_copies_data_stage() {
        let mut buffer = create_mock_setup_packet(0x21, 0x09, 0x0200, 0, 3).to_vec();
        buffer.extend_from_slice(&[0xA, 0xB, 0xC]);
        let transfer = control_fields(buffer, 11);

        let info = control_info_from_transfer(&transfer.lock()).unwrap();
        assert_eq!(info.direction, Direction::Out);
        assert_eq!(info.recipient, Recipient::Interface);
        assert_eq!(info.request_type, RequestType::Class);
        assert_eq!(info.request, 0x09);
        assert_eq!(info.value, 0x0200);
        assert_eq!(info.length, None);
        assert_eq!(info.data, Some(vec![0xA, 0xB, 0xC]));
    }

    #[test]
    fn test_generic_in_carries_length_only() {
        let info = build_generic_info(0x81, &[0u8; 64], 500);
        assert_eq!(info.direction, Direction::In);
        assert_eq!(info.length, Some(64));
        assert_eq!(info.data, None);
    }

    #[test]
    fn test_generic_out_copies_data() {
        let data = vec![1, 2, 3];
        let info = build_generic_info(0x02, &data, 0);
        assert_eq!(info.direction, Direction::Out);
        assert_eq!(info.length, None);
        assert_eq!(info.data, Some(data));
    }

    #[test]
    fn test_generic_from_transfer_uses_length() {
        let transfer = Transfer::new();
        {
            let mut fields = transfer.lock();
            fields.transfer_type = TransferType::Bulk;
            fields.endpoint = 0x02;
            fields.buffer = Some(vec![1, 2, 3, 4]);
            fields.length = 2;
        }
        let info = generic_info_from_transfer(&transfer.lock()).unwrap();
        assert_eq!(info.data, Some(vec![1, 2]));

        transfer.lock().length = 5;
        assert_eq!(
            generic_info_from_transfer(&transfer.lock()),
            Err(LibusbError::InvalidParam)
        );
    }
}
