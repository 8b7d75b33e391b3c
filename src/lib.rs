#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod internal;
pub mod platform;
mod raw;

extern crate alloc;

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{PAGE_HEADER_SIZE, RECORD_HEADER_SIZE, RecordKind, SEQ_NONE, WORD_SIZE};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::info;

/// Store geometry, checked once when the store is created. The region is
/// `num_pages` flash pages starting at `region_offset`; the page size is the
/// platform's erase unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Byte offset of the first reserved page inside the flash device. Must
    /// be a multiple of the page size.
    pub region_offset: u32,
    /// Number of pages reserved for the store, at least two. One of them is
    /// always kept fully erased.
    pub num_pages: u16,
    /// Size of the record id space; ids `0..num_records` are accepted.
    pub num_records: u8,
    /// Largest accepted payload per record in bytes.
    pub max_payload: usize,
}

/// A point-in-time view of the store region, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    /// Flash offset the next record will be programmed at.
    pub write_offset: u32,
    /// One entry per physical page, in region order.
    pub pages: Vec<PageInfo>,
    /// Ids that currently resolve to a record.
    pub live_records: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub index: u16,
    /// The page's sequence number, `None` for the erased spare.
    pub sequence: Option<u16>,
}

/// The record store. Owns its flash region exclusively; the in-RAM index
/// holds one flash offset per record id and is rebuilt from flash on every
/// initialization, never trusted across power loss.
pub struct Store<T: Platform> {
    hal: T,
    base: u32,
    num_pages: u16,
    max_payload: usize,
    ready: bool,

    // index: uid -> flash offset of the record header
    records: Vec<Option<u32>>,
    write_at: Option<u32>,
}

impl<T: Platform> Store<T> {
    /// Creates a store over `config.num_pages` pages of `hal`. Only checks
    /// the geometry; the flash is not touched until [`Store::init`] or the
    /// first operation.
    pub fn new(config: Config, hal: T) -> Result<Store<T>, Error> {
        let page_size = T::ERASE_SIZE;

        // The record format programs 16-bit words; byte-programmable flash
        // is fine too, anything wider is not.
        if T::WRITE_SIZE == 0 || !WORD_SIZE.is_multiple_of(T::WRITE_SIZE) || T::READ_SIZE != 1 {
            return Err(Error::InvalidConfig);
        }

        if !(config.region_offset as usize).is_multiple_of(page_size) {
            return Err(Error::InvalidRegionOffset);
        }

        let region = config.num_pages as usize * page_size;
        if config.num_pages < 2 || config.region_offset as usize + region > hal.capacity() {
            return Err(Error::InvalidConfig);
        }

        // A maximum-size record must leave room for the page header plus one
        // erased word, so the end-of-page marker always exists.
        if config.num_records == 0
            || config.max_payload == 0
            || config.max_payload > u16::MAX as usize
            || raw::record_span(config.max_payload) + PAGE_HEADER_SIZE + WORD_SIZE > page_size
        {
            return Err(Error::InvalidConfig);
        }

        Ok(Store {
            hal,
            base: config.region_offset,
            num_pages: config.num_pages,
            max_payload: config.max_payload,
            ready: false,
            records: vec![None; config.num_records as usize],
            write_at: None,
        })
    }

    /// Scans the region and rebuilds the record index. With `do_reset` set,
    /// a scan failure or a region without any valid page is answered by
    /// [`Store::format`]; otherwise the error is reported and the store
    /// stays uninitialized ([`Error::NotReady`] for the empty region).
    ///
    /// Calling this explicitly is optional: every operation initializes the
    /// store on first use, with `do_reset` set.
    pub fn init(&mut self, do_reset: bool) -> Result<(), Error> {
        if self.ready {
            return Ok(());
        }

        self.records.fill(None);
        self.write_at = None;

        match self.load_pages() {
            Ok(()) if self.write_at.is_some() => {
                self.ready = true;
                Ok(())
            }
            Ok(()) => {
                if do_reset {
                    #[cfg(feature = "defmt")]
                    info!("store region is blank, formatting");
                    self.format()
                } else {
                    Err(Error::NotReady)
                }
            }
            Err(err) => {
                if do_reset {
                    #[cfg(feature = "defmt")]
                    info!("scan failed ({}), formatting", err);
                    self.format()
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Writes a record for `uid`, superseding any earlier record with the
    /// same id. The payload must be `1..=max_payload` bytes.
    pub fn write(&mut self, uid: u8, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() || data.len() > self.max_payload {
            return Err(Error::PayloadSize);
        }
        if uid as usize >= self.records.len() {
            return Err(Error::InvalidId);
        }
        self.ensure_ready()?;

        self.append(RecordKind::Data, uid, data)
    }

    /// Copies the current record for `uid` into `buf` and returns the number
    /// of bytes copied, truncated to `buf.len()`. Returns 0 when the id is
    /// absent, the arguments are unusable or the store cannot be brought up;
    /// reading never fails with an error status.
    pub fn read(&mut self, uid: u8, buf: &mut [u8]) -> usize {
        if self.ensure_ready().is_err() {
            return 0;
        }
        if uid as usize >= self.records.len() || buf.is_empty() {
            return 0;
        }
        let Some(at) = self.records[uid as usize] else {
            return 0;
        };

        let mut hdr = [0u8; RECORD_HEADER_SIZE];
        if self.hal.read(at, &mut hdr).is_err() {
            return 0;
        }
        let size = raw::decode_record_header(&hdr).size as usize;

        // The spare byte of an odd-sized record sits right behind the
        // payload, so the copy is contiguous either way.
        let n = size.min(buf.len());
        if self
            .hal
            .read(at + RECORD_HEADER_SIZE as u32, &mut buf[..n])
            .is_err()
        {
            return 0;
        }
        n
    }

    /// Deletes the record for `uid` by appending a delete marker, so the
    /// deletion survives reboots. The id's index slot is cleared only after
    /// the marker verifies.
    pub fn del(&mut self, uid: u8) -> Result<(), Error> {
        if uid as usize >= self.records.len() {
            return Err(Error::InvalidId);
        }
        self.ensure_ready()?;

        self.append(RecordKind::Del, uid, &[])
    }

    /// Resets the region to a known state: erases every page, headers the
    /// first one with sequence 0 and re-initializes. All records are lost.
    pub fn format(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        info!("formatting {} pages", self.num_pages);

        self.ready = false;
        self.records.fill(None);

        for page in 0..self.num_pages {
            self.erase_page(page)?;
        }
        self.write_page_header(0, 0)?;

        self.init(false)
    }

    /// Returns per-page and per-record diagnostics. Initializes the store
    /// first if needed.
    pub fn statistics(&mut self) -> Result<Statistics, Error> {
        self.ensure_ready()?;

        let mut pages = Vec::with_capacity(self.num_pages as usize);
        for page in 0..self.num_pages {
            let seq = self.page_seq(page)?;
            pages.push(PageInfo {
                index: page,
                sequence: (seq != SEQ_NONE).then_some(seq),
            });
        }

        let live_records = (0..self.records.len() as u8)
            .filter(|&uid| self.records[uid as usize].is_some())
            .collect();

        Ok(Statistics {
            write_offset: self.write_at.ok_or(Error::NotReady)?,
            pages,
            live_records,
        })
    }

    fn ensure_ready(&mut self) -> Result<(), Error> {
        if self.ready { Ok(()) } else { self.init(true) }
    }
}
