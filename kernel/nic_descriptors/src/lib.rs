//! Receive and transmit descriptors, the 16-byte records through which the
//! driver and the NIC pass packet buffers back and forth.
//!
//! Every descriptor has two formats sharing the same memory: a "read" format that
//! the driver fills in before handing the slot to hardware, and a "write-back"
//! format that the hardware overwrites once it's done with the slot.
//!
//! The qword or dword holding the write-back status is an atomic: the device
//! sets it while the driver polls it, and a status with DD set publishes every
//! other write the device made to the slot and its buffer.

#![no_std]

#[macro_use] extern crate static_assertions;
extern crate volatile;
extern crate bit_field;
extern crate memory_structs;


use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};
use volatile::Volatile;
use bit_field::BitField;
use memory_structs::PhysicalAddress;


/// A trait for functionalities that all receive descriptors must support
pub trait RxDescriptor {
    /// Initializes a receive descriptor by clearing its status
    /// and setting the descriptor's physical address.
    ///
    /// # Arguments
    /// * `packet_buffer_address`: starting physical address of the receive buffer.
    fn init(&mut self, packet_buffer_address: PhysicalAddress);

    /// Updates the descriptor's physical address.
    ///
    /// # Arguments
    /// * `packet_buffer_address`: starting physical address of the receive buffer.
    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress);

    /// Returns the physical address the hardware should write the next packet to.
    fn packet_address(&self) -> PhysicalAddress;

    /// Clears the status bits of the descriptor.
    fn reset_status(&mut self);

    /// Returns true if the descriptor has a received packet copied to its buffer.
    fn descriptor_done(&self) -> bool;

    /// Returns true if the descriptor's packet buffer is the last in a frame.
    fn end_of_packet(&self) -> bool;

    /// The length of the packet in the descriptor's packet buffer.
    fn length(&self) -> u16;

    /// Hardware side: reports a received packet of `length` bytes in this slot.
    fn write_back(&self, length: u16, end_of_packet: bool);
}

/// A trait for functionalities that all transmit descriptors must support.
pub trait TxDescriptor {
    /// Initializes a transmit descriptor by clearing all of its values.
    fn init(&mut self);

    /// Updates the transmit descriptor to send the packet.
    /// We assume that one transmit descriptor will be used to send one packet.
    ///
    /// # Arguments
    /// * `transmit_buffer_addr`: physical address of the transmit buffer.
    /// * `transmit_buffer_length`: length of packet we want to send.
    fn send(&mut self, transmit_buffer_addr: PhysicalAddress, transmit_buffer_length: u16);

    /// Returns true once the hardware has finished sending this descriptor's packet.
    fn descriptor_done(&self) -> bool;

    /// Hardware side: the physical address of the packet to send.
    fn packet_address(&self) -> PhysicalAddress;

    /// Hardware side: the length of the packet to send.
    fn length(&self) -> u16;

    /// Hardware side: reports that the packet has been sent.
    fn write_back(&self);
}


/// Advanced Receive Descriptor (section 7.1.6 of the 82599 datasheet).
///
/// Read format, written by the driver:
/// * bytes 0..8: packet buffer address
/// * bytes 8..16: header buffer address (0, header splitting is never enabled)
///
/// Write-back format, written by the NIC:
/// * bytes 0..4: RSS type, packet type, header length (`wb_data`)
/// * bytes 4..8: RSS hash
/// * bytes 8..12: extended status and errors, DD is bit 0 and EOP is bit 1
/// * bytes 12..14: packet length
/// * bytes 14..16: VLAN tag
///
/// Writing the read format's header address also clears the write-back status,
/// which is what hands the slot back to hardware.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// Starting physical address of the receive buffer for the packet
    pub packet_buffer_address: Volatile<u64>,
    /// Starting physical address of the receive buffer for the header.
    /// This field will only be used if header splitting is enabled.
    /// In write-back format it holds the status, length and VLAN tag.
    pub header_buffer_address: AtomicU64,
}
const_assert_eq!(core::mem::size_of::<AdvancedRxDescriptor>(), 16);

impl RxDescriptor for AdvancedRxDescriptor {
    fn init(&mut self, packet_buffer_address: PhysicalAddress) {
        self.packet_buffer_address.write(packet_buffer_address.as_u64());
        // set the header address to 0 because packet splitting is not supposed to be enabled in the 82599
        self.header_buffer_address.store(0, Ordering::Relaxed);
    }

    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress) {
        self.packet_buffer_address.write(packet_buffer_address.as_u64());
    }

    fn packet_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_u64(self.packet_buffer_address.read())
    }

    fn reset_status(&mut self) {
        self.header_buffer_address.store(0, Ordering::Relaxed);
    }

    fn descriptor_done(&self) -> bool {
        self.status_error() & RX_STATUS_DD == RX_STATUS_DD
    }

    fn end_of_packet(&self) -> bool {
        self.status_error() & RX_STATUS_EOP == RX_STATUS_EOP
    }

    fn length(&self) -> u16 {
        self.pkt_len()
    }

    fn write_back(&self, length: u16, end_of_packet: bool) {
        let status = if end_of_packet { RX_STATUS_DD | RX_STATUS_EOP } else { RX_STATUS_DD };
        // nothing to report for RSS, so the first qword keeps the buffer address
        let mut wb = 0u64;
        wb.set_bits(0..32, status as u64);
        wb.set_bits(32..48, length as u64);
        // status, length and VLAN tag land in one store
        self.header_buffer_address.store(wb, Ordering::Release);
    }
}

impl AdvancedRxDescriptor {
    /// Read format: the header buffer address.
    pub fn header_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_u64(self.header_buffer_address.load(Ordering::Relaxed))
    }

    /// Read format: sets the header buffer address.
    pub fn set_header_address(&mut self, header_buffer_address: PhysicalAddress) {
        *self.header_buffer_address.get_mut() = header_buffer_address.as_u64();
    }

    /// The second qword as last written back by the device.
    fn write_back_word(&self) -> u64 {
        self.header_buffer_address.load(Ordering::Acquire)
    }

    /// Write-back format: the low dword with the RSS type, packet type and header length.
    pub fn wb_data(&self) -> u32 {
        self.packet_buffer_address.read().get_bits(0..32) as u32
    }

    pub fn set_wb_data(&mut self, value: u32) {
        self.packet_buffer_address.update(|v| { v.set_bits(0..32, value as u64); });
    }

    /// Write-back format: returns the packet type that was used for the Receive Side Scaling hash function.
    pub fn rss_type(&self) -> u8 {
        self.packet_buffer_address.read().get_bits(0..4) as u8
    }

    /// Write-back format: returns the packet type as identified by the hardware.
    pub fn packet_type(&self) -> u16 {
        self.packet_buffer_address.read().get_bits(4..17) as u16
    }

    /// Write-back format: returns the Receive Side Scaling hash.
    pub fn rss_hash(&self) -> u32 {
        self.packet_buffer_address.read().get_bits(32..64) as u32
    }

    /// Write-back format: the extended status (bits 0..20) and extended errors (bits 20..32).
    pub fn status_error(&self) -> u32 {
        self.write_back_word().get_bits(0..32) as u32
    }

    pub fn set_status_error(&mut self, value: u32) {
        self.header_buffer_address.get_mut().set_bits(0..32, value as u64);
    }

    /// Write-back format: returns errors reported by hardware for different packet types.
    pub fn ext_error(&self) -> u16 {
        self.status_error().get_bits(20..32) as u16
    }

    /// Write-back format: returns the number of bytes posted to the packet buffer.
    pub fn pkt_len(&self) -> u16 {
        self.write_back_word().get_bits(32..48) as u16
    }

    pub fn set_pkt_len(&mut self, length: u16) {
        self.header_buffer_address.get_mut().set_bits(32..48, length as u64);
    }

    /// Write-back format: if the vlan header is stripped from the packet, then the 16 bits of the VLAN tag are posted here.
    pub fn vlan_tag(&self) -> u16 {
        self.write_back_word().get_bits(48..64) as u16
    }

    pub fn set_vlan_tag(&mut self, tag: u16) {
        self.header_buffer_address.get_mut().set_bits(48..64, tag as u64);
    }
}

impl fmt::Debug for AdvancedRxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{Packet buffer address: {:#X}, Packet header address: {:#X}}}",
            self.packet_buffer_address.read(), self.header_buffer_address.load(Ordering::Relaxed))
    }
}


/// Advanced Transmit Data Descriptor (section 7.2.3.2.4 of the 82599 datasheet).
///
/// Read format, written by the driver:
/// * bytes 0..8: packet buffer address
/// * bytes 8..12: `cmd_type_len`, the data length plus the descriptor type and command bits
/// * bytes 12..16: `olinfo_status`, the payload length and offload options
///
/// Write-back format, written by the NIC:
/// * bytes 0..8: reserved
/// * bytes 8..12: `nxtseq_seed`
/// * bytes 12..16: status, DD is bit 0
#[repr(C)]
pub struct AdvancedTxDescriptor {
    /// Starting physical address of the transmit buffer
    pub packet_buffer_address: Volatile<u64>,
    /// Data length, descriptor type, and command bits
    pub cmd_type_len: Volatile<u32>,
    /// Payload length and offload options; the write-back status in write-back format
    pub olinfo_status: AtomicU32,
}
const_assert_eq!(core::mem::size_of::<AdvancedTxDescriptor>(), 16);

impl TxDescriptor for AdvancedTxDescriptor {
    fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.cmd_type_len.write(0);
        self.olinfo_status.store(0, Ordering::Relaxed);
    }

    fn send(&mut self, transmit_buffer_addr: PhysicalAddress, transmit_buffer_length: u16) {
        let length = transmit_buffer_length as u32;
        self.packet_buffer_address.write(transmit_buffer_addr.as_u64());
        self.cmd_type_len.write(
            TX_DCMD_EOP | TX_DCMD_RS | TX_DCMD_IFCS | TX_DCMD_DEXT | TX_DTYP_DATA | length
        );
        // also clears DD from the previous write-back
        self.olinfo_status.store(length << TX_PAYLEN_SHIFT, Ordering::Relaxed);
    }

    fn descriptor_done(&self) -> bool {
        self.status() & TX_STATUS_DD == TX_STATUS_DD
    }

    fn packet_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_u64(self.packet_buffer_address.read())
    }

    fn length(&self) -> u16 {
        self.cmd_type_len.read().get_bits(0..16) as u16
    }

    fn write_back(&self) {
        self.olinfo_status.store(TX_STATUS_DD, Ordering::Release);
    }
}

impl AdvancedTxDescriptor {
    /// Write-back format: the status dword.
    pub fn status(&self) -> u32 {
        self.olinfo_status.load(Ordering::Acquire)
    }

    /// Write-back format: the seed for the next descriptor's sequence number.
    pub fn nxtseq_seed(&self) -> u32 {
        self.cmd_type_len.read()
    }
}

impl fmt::Debug for AdvancedTxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, cmd_type_len: {:#X}, olinfo_status: {:#X}}}",
            self.packet_buffer_address.read(), self.cmd_type_len.read(), self.olinfo_status.load(Ordering::Relaxed))
    }
}


// Transmit descriptor bits
/// Tx Command: End of Packet
pub const TX_DCMD_EOP:                     u32 = 1 << 24;
/// Tx Command: Insert FCS
pub const TX_DCMD_IFCS:                    u32 = 1 << 25;
/// Tx Command: Report Status
pub const TX_DCMD_RS:                      u32 = 1 << 27;
/// Tx Command: Descriptor Extension (advanced format)
pub const TX_DCMD_DEXT:                    u32 = 1 << 29;
/// Tx Descriptor Type: advanced data descriptor
pub const TX_DTYP_DATA:                    u32 = 0b11 << 20;
/// Shift of the payload length within `olinfo_status`
pub const TX_PAYLEN_SHIFT:                 u32 = 14;
/// Tx Status: descriptor Done
pub const TX_STATUS_DD:                    u32 = 1 << 0;

// Receive descriptor bits
/// Rx Status: Descriptor Done
pub const RX_STATUS_DD:                    u32 = 1 << 0;
/// Rx Status: End of Packet
pub const RX_STATUS_EOP:                   u32 = 1 << 1;
