use crate::Store;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    self, CRC_SEED, PAGE_HEADER_SIZE, RECORD_HEADER_SIZE, RECORD_OVERHEAD, RecordKind, SEQ_NONE,
    record_span, seq_after, seq_before,
};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{error, trace, warn};

impl<T: Platform> Store<T> {
    pub(crate) fn page_size(&self) -> u32 {
        T::ERASE_SIZE as u32
    }

    pub(crate) fn page_base(&self, page: u16) -> u32 {
        self.base + page as u32 * self.page_size()
    }

    fn page_end(&self, page: u16) -> u32 {
        self.page_base(page) + self.page_size()
    }

    pub(crate) fn page_of(&self, offset: u32) -> u16 {
        ((offset - self.base) / self.page_size()) as u16
    }

    fn next_page(&self, page: u16) -> u16 {
        (page + 1) % self.num_pages
    }

    /// Reads the sequence number of a page, `SEQ_NONE` if the page header is
    /// erased or does not check out.
    pub(crate) fn page_seq(&mut self, page: u16) -> Result<u16, Error> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        self.hal
            .read(self.page_base(page), &mut buf)
            .map_err(|_| Error::Flash)?;
        Ok(raw::decode_page_header(&buf, T::crc8))
    }

    /// Writes a fresh page header and moves the write pointer behind it.
    pub(crate) fn write_page_header(&mut self, page: u16, seq: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_page_header: page {} seq {}", page, seq);

        #[cfg(feature = "debug-logs")]
        println!("internal: write_page_header: page {page} seq {seq}");

        let base = self.page_base(page);
        let buf = raw::encode_page_header(seq, T::crc8);
        self.hal.write(base, &buf).map_err(|_| {
            #[cfg(feature = "defmt")]
            error!("flash error while writing page header {}", page);
            Error::Flash
        })?;
        self.write_at = Some(base + PAGE_HEADER_SIZE as u32);
        Ok(())
    }

    pub(crate) fn erase_page(&mut self, page: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_page: page {}", page);

        let base = self.page_base(page);
        self.hal
            .erase(base, base + self.page_size())
            .map_err(|_| Error::Flash)
    }

    /// Walks one page and replays its records into the index. Only the most
    /// recent page is walked with `update_write_at` set, which places the
    /// write pointer at the first word of the erased tail.
    pub(crate) fn scan_page(&mut self, page: u16, update_write_at: bool) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("scan_page: page {}", page);

        #[cfg(feature = "debug-logs")]
        println!("internal: scan_page: page {page}");

        let end = self.page_end(page);
        let mut at = self.page_base(page) + PAGE_HEADER_SIZE as u32;
        let mut span_buf: Vec<u8> = Vec::new();

        loop {
            if at + RECORD_OVERHEAD as u32 > end {
                // Too little room left for even an empty record. The writer
                // never lets a record end flush with the page, so this tail
                // is erased and the next record goes here.
                if update_write_at && at < end {
                    self.write_at = Some(at);
                }
                break;
            }

            let mut hdr = [0u8; RECORD_HEADER_SIZE];
            self.hal.read(at, &mut hdr).map_err(|_| Error::Flash)?;

            if raw::is_erased_word(&hdr) {
                #[cfg(feature = "debug-logs")]
                println!("internal: scan_page: end of page @{at:#010x}");
                if update_write_at {
                    self.write_at = Some(at);
                }
                break;
            }

            let rec = raw::decode_record_header(&hdr);
            if rec.uid as usize >= self.records.len() {
                // Not erased and not a plausible record either.
                return Err(Error::Data);
            }

            let span = record_span(rec.size as usize);
            if at + span as u32 > end {
                // A record never crosses a page boundary.
                return Err(Error::Data);
            }

            span_buf.resize(span, 0);
            self.hal.read(at, &mut span_buf).map_err(|_| Error::Flash)?;
            if T::crc8(CRC_SEED, &span_buf) != 0 {
                #[cfg(feature = "defmt")]
                error!("invalid record crc @{:#010x}", at);
                return Err(Error::Crc);
            }

            match RecordKind::from_repr(rec.magic) {
                Some(RecordKind::Data) => {
                    #[cfg(feature = "debug-logs")]
                    println!("internal: scan_page: uid {} data @{at:#010x}", rec.uid);
                    self.records[rec.uid as usize] = Some(at);
                }
                Some(RecordKind::Del) => {
                    #[cfg(feature = "debug-logs")]
                    println!("internal: scan_page: uid {} deleted @{at:#010x}", rec.uid);
                    self.records[rec.uid as usize] = None;
                }
                None => {
                    // Checksum is fine but the magic is unknown; skip the
                    // record and keep walking.
                    #[cfg(feature = "defmt")]
                    warn!("unknown record magic {:#04x} @{:#010x}", rec.magic, at);
                }
            }

            at += span as u32;
        }

        Ok(())
    }

    /// Scans the whole region: orders the live pages by sequence number,
    /// replays them oldest to newest and finishes an interrupted rotation if
    /// one is found. Leaves the write pointer unset when the region carries
    /// no pages at all.
    pub(crate) fn load_pages(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_pages");

        let mut found: Vec<(u16, u16)> = Vec::with_capacity(self.num_pages as usize);
        for page in 0..self.num_pages {
            let seq = self.page_seq(page)?;
            if seq != SEQ_NONE {
                found.push((seq, page));
            }
        }
        if found.is_empty() {
            return Ok(());
        }

        // The oldest page is the one whose predecessor sequence is absent;
        // sequence numbers form a contiguous run that may wrap at 0xFFFE.
        let mut start = None;
        for &(seq, page) in &found {
            if found.iter().any(|&(s, p)| s == seq && p != page) {
                #[cfg(feature = "defmt")]
                error!("duplicate page sequence {}", seq);
                return Err(Error::Layout);
            }
            if !found.iter().any(|&(s, _)| s == seq_before(seq)) {
                if start.is_some() {
                    return Err(Error::Layout);
                }
                start = Some((seq, page));
            }
        }
        let Some((mut seq, mut page)) = start else {
            return Err(Error::Layout);
        };

        // Walk the chain oldest to newest. Rotation always moves to the
        // physically next page, so the chain must follow wrap order.
        let mut order: Vec<u16> = Vec::with_capacity(found.len());
        order.push(page);
        for _ in 1..found.len() {
            let next = seq_after(seq);
            let Some(&(_, next_page)) = found.iter().find(|&&(s, _)| s == next) else {
                return Err(Error::Layout);
            };
            if next_page != self.next_page(page) {
                return Err(Error::Layout);
            }
            order.push(next_page);
            seq = next;
            page = next_page;
        }

        let newest = *order.last().unwrap_or(&page);
        for &p in &order {
            self.scan_page(p, p == newest)?;
        }

        if order.len() == self.num_pages as usize {
            // Every page carries a header, so power was lost after a fresh
            // page header went out but before the recycled page was erased.
            self.finish_rotation(newest)?;
        }
        Ok(())
    }

    /// Completes an interrupted rotation: whatever is still live on the page
    /// that was about to be recycled moves to the newest page, then the old
    /// page is erased. Relocating before erasing keeps every intermediate
    /// state recoverable.
    fn finish_rotation(&mut self, newest: u16) -> Result<(), Error> {
        let victim = self.next_page(newest);

        #[cfg(feature = "defmt")]
        warn!("finishing interrupted rotation, recycling page {}", victim);

        for uid in 0..self.records.len() as u8 {
            if let Some(at) = self.records[uid as usize]
                && self.page_of(at) == victim
            {
                self.relocate(uid)?;
            }
        }
        self.erase_page(victim)
    }

    /// Moves the write frontier onto the spare page and recycles the oldest
    /// page behind it. `exclude_uid` is the record about to be rewritten by
    /// the caller; relocating it would be wasted flash.
    pub(crate) fn rotate(&mut self, exclude_uid: u8) -> Result<(), Error> {
        let at = self.write_at.ok_or(Error::NotReady)?;
        let page = self.page_of(at);
        let seq = self.page_seq(page)?;
        if seq == SEQ_NONE {
            return Err(Error::Layout);
        }

        let next = self.next_page(page);
        if self.page_seq(next)? != SEQ_NONE {
            // The spare must be erased before the frontier can move there.
            #[cfg(feature = "defmt")]
            error!("spare page {} is not erased", next);
            return Err(Error::Layout);
        }

        #[cfg(feature = "defmt")]
        trace!("rotate: page {} -> {}", page, next);

        #[cfg(feature = "debug-logs")]
        println!("internal: rotate: page {page} -> {next}");

        self.write_page_header(next, seq_after(seq))?;

        let victim = self.next_page(next);
        for uid in 0..self.records.len() as u8 {
            if uid == exclude_uid {
                continue;
            }
            if let Some(rec_at) = self.records[uid as usize]
                && self.page_of(rec_at) == victim
            {
                self.relocate(uid)?;
            }
        }

        self.erase_page(victim)
    }

    /// Rewrites the record a uid currently points at to the write pointer.
    /// The bytes on flash are already correctly encoded, so a span copy is
    /// enough; the index moves only after the copy verifies.
    fn relocate(&mut self, uid: u8) -> Result<(), Error> {
        let Some(src) = self.records[uid as usize] else {
            return Ok(());
        };

        let mut hdr = [0u8; RECORD_HEADER_SIZE];
        self.hal.read(src, &mut hdr).map_err(|_| Error::Flash)?;
        let span = record_span(raw::decode_record_header(&hdr).size as usize);

        let dst = self.write_at.ok_or(Error::NotReady)?;
        if dst + span as u32 >= self.page_end(self.page_of(dst)) {
            // Live records exceeding a single page is a geometry fault;
            // surface it instead of corrupting the neighbour page.
            return Err(Error::Layout);
        }

        #[cfg(feature = "defmt")]
        trace!("relocate: uid {} @{:#010x} -> @{:#010x}", uid, src, dst);

        let mut buf = vec![0u8; span];
        self.hal.read(src, &mut buf).map_err(|_| Error::Flash)?;
        if let Err(err) = self.program(&buf) {
            self.write_at = Some(dst + span as u32);
            return Err(err);
        }
        self.verify(dst, span)?;

        self.records[uid as usize] = Some(dst);
        Ok(())
    }

    /// Appends one record at the write pointer, rotating to the spare page
    /// first when it would not fit. Used for data and delete records alike,
    /// so a delete marker near the end of a page rotates like any write.
    pub(crate) fn append(&mut self, kind: RecordKind, uid: u8, data: &[u8]) -> Result<(), Error> {
        let header = raw::encode_record_header(kind, uid, data.len() as u16);
        let span = record_span(data.len());

        let mut at = self.write_at.ok_or(Error::NotReady)?;
        if at + span as u32 >= self.page_end(self.page_of(at)) {
            self.rotate(uid)?;
            at = self.write_at.ok_or(Error::NotReady)?;
        }

        #[cfg(feature = "defmt")]
        trace!("append: {} uid {} ({} bytes) @{:#010x}", kind, uid, data.len(), at);

        #[cfg(feature = "debug-logs")]
        println!("internal: append: {kind} uid {uid} ({} bytes) @{at:#010x}", data.len());

        // An odd payload keeps its last byte in the footer's spare slot so
        // only whole words ever get programmed.
        let (body, spare) = if data.len().is_multiple_of(2) {
            (data, 0u8)
        } else {
            (&data[..data.len() - 1], data[data.len() - 1])
        };

        if let Err(err) = self.program_record(&header, body, spare) {
            // Skip what the torn record claimed so later appends stay word
            // aligned behind it; the next scan reports it as a crc failure.
            self.write_at = Some(at + span as u32);
            return Err(err);
        }

        self.verify(at, span)?;

        match kind {
            RecordKind::Data => self.records[uid as usize] = Some(at),
            RecordKind::Del => self.records[uid as usize] = None,
        }
        Ok(())
    }

    /// Header, payload and footer go out as separate program operations; the
    /// checksum is built alongside and lands in the footer's last byte.
    fn program_record(
        &mut self,
        header: &[u8; RECORD_HEADER_SIZE],
        body: &[u8],
        spare: u8,
    ) -> Result<(), Error> {
        let mut crc = T::crc8(CRC_SEED, header);
        self.program(header)?;
        if !body.is_empty() {
            crc = T::crc8(crc, body);
            self.program(body)?;
        }
        crc = T::crc8(crc, &[spare]);
        self.program(&raw::encode_footer(spare, crc))
    }

    /// Programs at the write pointer and advances it.
    fn program(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let at = self.write_at.ok_or(Error::NotReady)?;
        self.hal.write(at, bytes).map_err(|_| {
            #[cfg(feature = "defmt")]
            error!("flash error while programming @{:#010x}", at);
            Error::Flash
        })?;
        self.write_at = Some(at + bytes.len() as u32);
        Ok(())
    }

    /// Re-reads a freshly programmed span and checks it sums to zero, which
    /// catches flash readback corruption before the index is updated.
    fn verify(&mut self, start: u32, span: usize) -> Result<(), Error> {
        let mut buf = vec![0u8; span];
        self.hal.read(start, &mut buf).map_err(|_| Error::Flash)?;
        if T::crc8(CRC_SEED, &buf) != 0 {
            #[cfg(feature = "defmt")]
            error!("readback crc mismatch @{:#010x}", start);
            return Err(Error::Crc);
        }
        Ok(())
    }
}
