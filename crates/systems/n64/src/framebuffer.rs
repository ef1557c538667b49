//! Framebuffer identity table
//!
//! A framebuffer is identified by its RDRAM address. Its pixel size and width
//! are part of the identity too: when a game reuses an address with another
//! format the entry is kept but flagged `format_changed`, and its cached RAM
//! state is discarded so the next [`Framebuffer::check_rdram`] re-reads it in
//! full.
//!
//! RAM synchronization works on CRC32 hashes of the backing region. An
//! unchanged hash produces no change at all; a changed hash is narrowed down
//! to the dirty rows by diffing against the bytes seen last time.

use hle_core::graphics::PixelSize;
use hle_core::logging::{log, LogCategory, LogLevel};
use hle_core::types::FixedRect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a framebuffer was last written on the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    Color,
    Depth,
}

/// RAM contents that must be uploaded to the framebuffer's render target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramebufferChange {
    pub address: u32,
    pub siz: PixelSize,
    pub width: u32,
    /// Dirty region in framebuffer pixels
    pub rect: FixedRect,
    /// Rows `rect.top..rect.bottom`, full stride each
    pub data: Vec<u8>,
}

impl FramebufferChange {
    pub fn is_full(&self, height: u32) -> bool {
        self.rect.top == 0 && self.rect.height() == height
    }
}

#[derive(Debug, Clone)]
pub struct Framebuffer {
    pub address: u32,
    pub siz: PixelSize,
    pub width: u32,
    pub height: u32,
    pub last_write_type: WriteType,
    pub last_write_rect: FixedRect,
    /// Workload id of the last GPU write; 0 = never written
    pub last_write_timestamp: u64,
    pub ram_bytes: Vec<u8>,
    pub ram_hash: Option<u32>,
    /// Rows already synchronized from RAM
    pub read_height: u32,
    pub format_changed: bool,
    /// Cleared when the CPU changed RAM over GPU output in the last sync
    pub interpolation_enabled: bool,
}

impl Framebuffer {
    pub fn new(address: u32, siz: PixelSize, width: u32, height: u32) -> Self {
        Self {
            address,
            siz,
            width,
            height,
            last_write_type: WriteType::Color,
            last_write_rect: FixedRect::default(),
            last_write_timestamp: 0,
            ram_bytes: Vec::new(),
            ram_hash: None,
            read_height: 0,
            format_changed: false,
            interpolation_enabled: true,
        }
    }

    /// Bytes per row.
    pub fn stride(&self) -> u32 {
        self.siz.bytes_for(self.width)
    }

    pub fn byte_count(&self) -> u32 {
        self.stride() * self.height
    }

    /// One past the last RDRAM byte backing this framebuffer.
    pub fn end_address(&self) -> u32 {
        self.address + self.byte_count()
    }

    pub fn contains_address(&self, address: u32) -> bool {
        address >= self.address && address < self.end_address()
    }

    pub fn bounds(&self) -> FixedRect {
        FixedRect::new(0, 0, self.width as i32, self.height as i32)
    }

    pub fn was_written(&self) -> bool {
        self.last_write_timestamp > 0
    }

    /// Update the format. A different `siz` or `width` invalidates the RAM
    /// state; height only ever grows.
    pub fn set_format(&mut self, siz: PixelSize, width: u32, height: u32) {
        if self.siz != siz || self.width != width {
            log(LogCategory::Framebuffer, LogLevel::Debug, || {
                format!(
                    "Framebuffer 0x{:06X} changed format {:?}x{} -> {:?}x{}",
                    self.address, self.siz, self.width, siz, width
                )
            });
            self.siz = siz;
            self.width = width;
            self.height = height;
            self.invalidate_ram();
            self.format_changed = true;
        } else if height > self.height {
            self.height = height;
        }
    }

    pub fn invalidate_ram(&mut self) {
        self.ram_bytes.clear();
        self.ram_hash = None;
        self.read_height = 0;
    }

    pub fn record_write(&mut self, write_type: WriteType, rect: FixedRect, timestamp: u64) {
        if self.last_write_timestamp == timestamp && self.last_write_type == write_type {
            self.last_write_rect = self.last_write_rect.merge(&rect);
        } else {
            self.last_write_rect = rect;
        }
        self.last_write_type = write_type;
        self.last_write_timestamp = timestamp;
    }

    /// Compare the backing RDRAM region against the last synchronized state.
    ///
    /// Returns `None` when the hash is unchanged. Otherwise stores the new
    /// bytes and hash, and returns the rows that must be uploaded: the whole
    /// framebuffer on first read or after a format change, just the differing
    /// rows otherwise.
    pub fn check_rdram(&mut self, rdram: &[u8]) -> Option<FramebufferChange> {
        let start = (self.address as usize).min(rdram.len());
        let end = (self.end_address() as usize).min(rdram.len());
        let region = &rdram[start..end];
        let hash = crc32fast::hash(region);

        let full = self.format_changed
            || self.ram_hash.is_none()
            || self.ram_bytes.len() != region.len();
        if !full && self.ram_hash == Some(hash) {
            return None;
        }

        let stride = self.stride() as usize;
        let rows = if stride == 0 { 0 } else { region.len() / stride };
        let (first, last) = if full {
            (0, rows)
        } else {
            let mut dirty = (0..rows).filter(|row| {
                let span = row * stride..(row + 1) * stride;
                region[span.clone()] != self.ram_bytes[span]
            });
            let first = dirty.next();
            let last = dirty.last().or(first);
            match (first, last) {
                (Some(first), Some(last)) => (first, last + 1),
                // Differences past the last full row only.
                _ => (rows.saturating_sub(1), rows),
            }
        };

        self.ram_bytes.clear();
        self.ram_bytes.extend_from_slice(region);
        self.ram_hash = Some(hash);
        self.read_height = rows as u32;
        self.format_changed = false;

        if first >= last {
            return None;
        }

        log(LogCategory::Framebuffer, LogLevel::Trace, || {
            format!(
                "Framebuffer 0x{:06X} RAM changed, rows {}..{}{}",
                self.address,
                first,
                last,
                if full { " (full)" } else { "" }
            )
        });

        Some(FramebufferChange {
            address: self.address,
            siz: self.siz,
            width: self.width,
            rect: FixedRect::new(0, first as i32, self.width as i32, last as i32),
            data: region[first * stride..last * stride].to_vec(),
        })
    }
}

/// All framebuffers referenced since the last reset, keyed by address.
#[derive(Default)]
pub struct FramebufferTable {
    framebuffers: BTreeMap<u32, Framebuffer>,
}

impl FramebufferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the framebuffer at `address`, creating it on first reference.
    pub fn get_or_create(
        &mut self,
        address: u32,
        siz: PixelSize,
        width: u32,
        height: u32,
    ) -> &mut Framebuffer {
        let fb = self.framebuffers.entry(address).or_insert_with(|| {
            log(LogCategory::Framebuffer, LogLevel::Debug, || {
                format!(
                    "New framebuffer 0x{:06X} {:?} {}x{}",
                    address, siz, width, height
                )
            });
            Framebuffer::new(address, siz, width, height)
        });
        fb.set_format(siz, width, height);
        fb
    }

    pub fn find(&self, address: u32) -> Option<&Framebuffer> {
        self.framebuffers.get(&address)
    }

    pub fn find_mut(&mut self, address: u32) -> Option<&mut Framebuffer> {
        self.framebuffers.get_mut(&address)
    }

    /// Most recently written framebuffer whose RDRAM range overlaps
    /// `address..address + len`.
    pub fn find_overlapping(&self, address: u32, len: u32) -> Option<&Framebuffer> {
        let end = address.saturating_add(len.max(1));
        self.framebuffers
            .values()
            .filter(|fb| fb.was_written() && fb.address < end && address < fb.end_address())
            .max_by_key(|fb| fb.last_write_timestamp)
    }

    pub fn record_write(
        &mut self,
        address: u32,
        write_type: WriteType,
        rect: FixedRect,
        timestamp: u64,
    ) {
        if let Some(fb) = self.framebuffers.get_mut(&address) {
            fb.record_write(write_type, rect, timestamp);
        }
    }

    /// Hash-check the framebuffer at `address` against RDRAM.
    pub fn check_rdram(&mut self, address: u32, rdram: &[u8]) -> Option<FramebufferChange> {
        self.framebuffers.get_mut(&address)?.check_rdram(rdram)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Framebuffer> {
        self.framebuffers.values()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    pub fn reset(&mut self) {
        log(LogCategory::Framebuffer, LogLevel::Debug, || {
            format!("Resetting {} framebuffers", self.framebuffers.len())
        });
        self.framebuffers.clear();
    }
}
