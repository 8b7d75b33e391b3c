#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

pub const PAGE_SIZE: usize = 1024;
pub const WORD_SIZE: usize = 2;
pub const PAGE_HEADER_SIZE: usize = 4;

/// The default geometry used by the end-to-end scenarios.
pub fn config(pages: u16) -> recstore::Config {
    recstore::Config {
        region_offset: 0,
        num_pages: pages,
        num_records: 4,
        max_payload: 256,
    }
}

/// In-memory NOR flash: bits only flip from 1 to 0 on write, erase restores
/// whole pages to 0xFF. Every operation is logged, and all operations from
/// `fail_after_operation` onward fail, which is how the tests cut power at
/// an exact point.
#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub fail_only_operation: Option<usize>,
    ops_attempted: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xFFu8; PAGE_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    /// A flash carrying the surviving bytes of another run, e.g. to simulate
    /// a reboot after a power cut.
    pub fn from_buf(buf: Vec<u8>) -> Self {
        Self {
            buf,
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_only_operation = None;
    }

    /// Fails the current operation when a fault is configured for it.
    /// Counts attempts rather than successes so a single injected fault does
    /// not stall every following operation.
    fn faulted(&mut self) -> bool {
        let index = self.ops_attempted;
        self.ops_attempted += 1;
        index >= self.fail_after_operation || self.fail_only_operation == Some(index)
    }

    pub fn page_erased(&self, page: usize) -> bool {
        self.buf[page * PAGE_SIZE..(page + 1) * PAGE_SIZE]
            .iter()
            .all(|&b| b == 0xFF)
    }

    pub fn erased_pages(&self) -> usize {
        (0..self.buf.len() / PAGE_SIZE)
            .filter(|&page| self.page_erased(page))
            .count()
    }

    /// Number of erase operations per page, in page order.
    pub fn erases_per_page(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.buf.len() / PAGE_SIZE];
        for op in &self.operations {
            if let Operation::Erase { offset, .. } = op {
                counts[*offset as usize / PAGE_SIZE] += 1;
            }
        }
        counts
    }

    /// Index of the first write operation touching the given offset.
    pub fn find_write(&self, offset: u32) -> Option<usize> {
        self.operations
            .iter()
            .position(|op| matches!(op, Operation::Write { offset: o, .. } if *o == offset))
    }

    /// Index of the first erase operation of the given page.
    pub fn find_erase(&self, page: usize) -> Option<usize> {
        let base = (page * PAGE_SIZE) as u32;
        self.operations
            .iter()
            .position(|op| matches!(op, Operation::Erase { offset: o, .. } if *o == base))
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {op:?}");
        }
    }
}

#[derive(Debug)]
pub struct FlashFault;

impl NorFlashError for FlashFault {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashFault;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.faulted() {
            return Err(FlashFault);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;
    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as u32));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as u32));

        if self.faulted() {
            return Err(FlashFault);
        }
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for byte in &mut self.buf[from as usize..to as usize] {
            *byte = 0xFF;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as u32));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE));
        assert!(!bytes.is_empty());

        if self.faulted() {
            return Err(FlashFault);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // programming only flips bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl recstore::platform::Crc for Flash {
    fn crc8(init: u8, data: &[u8]) -> u8 {
        crc8(init, data)
    }
}

/// CRC-8/SMBUS: no reflection, no output XOR, so resuming from a previous
/// value works and a span followed by its own checksum sums to zero.
pub fn crc8(init: u8, data: &[u8]) -> u8 {
    let algo = crc::Crc::<u8>::new(&crc::CRC_8_SMBUS);
    let mut digest = algo.digest_with_initial(init);
    digest.update(data);
    digest.finalize()
}

/// Encodes a complete record the way the store lays it out on flash, for
/// tests that plant bytes directly in the flash buffer.
pub fn encode_record(magic: u8, uid: u8, payload: &[u8]) -> Vec<u8> {
    let size = payload.len();
    let (body, spare) = if size % 2 == 0 {
        (payload, 0u8)
    } else {
        (&payload[..size - 1], payload[size - 1])
    };

    let mut bytes = vec![magic, uid, size as u8, (size >> 8) as u8];
    bytes.extend_from_slice(body);
    bytes.push(spare);
    let crc = crc8(0, &bytes);
    bytes.push(crc);
    bytes
}
