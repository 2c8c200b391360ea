/// Every ISP instruction is exactly four bytes on the wire.
pub const ISP_FRAME_SIZE: usize = 4;

/// Vendor byte (signature byte 0) of every Atmel/Microchip AVR.
pub const ATMEL_VENDOR_CODE: u8 = 0x1e;

/// Longest catalog name, one short of a 16 byte NUL-terminated field.
pub const MAX_NAME_LEN: usize = 15;

/// Byte values of the serial programming instruction set.
pub mod commands {
    pub const PROGRAMMING_ENABLE: [u8; 2] = [0xac, 0x53];
    pub const CHIP_ERASE: [u8; 2] = [0xac, 0x80];
    pub const LOAD_EXTENDED_ADDRESS: u8 = 0x4d;
    pub const LOAD_PAGE_LOW: u8 = 0x40;
    pub const LOAD_PAGE_HIGH: u8 = 0x48;
    pub const WRITE_PAGE: u8 = 0x4c;
    pub const READ_PROGRAM_LOW: u8 = 0x20;
    pub const READ_PROGRAM_HIGH: u8 = 0x28;
    pub const READ_SIGNATURE: u8 = 0x30;

    pub const WRITE_LOCK: [u8; 2] = [0xac, 0xe0];
    pub const WRITE_FUSE_LOW: [u8; 2] = [0xac, 0xa0];
    pub const WRITE_FUSE_HIGH: [u8; 2] = [0xac, 0xa8];
    pub const WRITE_FUSE_EXTENDED: [u8; 2] = [0xac, 0xa4];

    pub const READ_LOCK: [u8; 2] = [0x58, 0x00];
    pub const READ_FUSE_LOW: [u8; 2] = [0x50, 0x00];
    pub const READ_FUSE_HIGH: [u8; 2] = [0x58, 0x08];
    pub const READ_FUSE_EXTENDED: [u8; 2] = [0x50, 0x08];
}

/// Serial bridge framing.
pub mod bridge {
    pub const TRANSACT: u8 = b'T';
    pub const RESET: u8 = b'R';
    pub const PRESCALER: u8 = b'P';
    pub const ACK: u8 = 0x10;
}
