//! OTA selection log
//!
//! Two erase sectors each hold one record: a sequence number, an image
//! state, and a CRC.  The valid record with the highest sequence number
//! selects the boot slot as `(seq - 1) % slot_count`.  A new record always
//! replaces the inactive copy, so losing power while it is written leaves
//! the previous selection in effect.

use core::mem::size_of;

use storage::{align_up, Flash, Region};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::config::sizes;
use crate::{Error, Result};

/// Sequence number of an erased record.
pub const SEQ_ERASED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum ImageState {
    New = 0,
    PendingVerify = 1,
    Valid = 2,
    Invalid = 3,
    Aborted = 4,
    Undefined = 0xffff_ffff,
}

impl ImageState {
    pub fn from_raw(raw: u32) -> Option<ImageState> {
        match raw {
            0 => Some(ImageState::New),
            1 => Some(ImageState::PendingVerify),
            2 => Some(ImageState::Valid),
            3 => Some(ImageState::Invalid),
            4 => Some(ImageState::Aborted),
            0xffff_ffff => Some(ImageState::Undefined),
            _ => None,
        }
    }

    /// Images in these states are never selected.
    pub fn is_rejected(&self) -> bool {
        matches!(self, ImageState::Invalid | ImageState::Aborted)
    }
}

#[derive(Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct RawRecord {
    seq: U32<LittleEndian>,
    state: U32<LittleEndian>,
    crc: U32<LittleEndian>,
}

pub const RECORD_SIZE: usize = size_of::<RawRecord>();

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OtaRecord {
    pub seq: u32,
    pub state: ImageState,
}

impl OtaRecord {
    pub fn new(seq: u32, state: ImageState) -> OtaRecord {
        OtaRecord { seq, state }
    }

    /// CRC32 over the little-endian sequence and state words.
    pub fn crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.seq.to_le_bytes());
        hasher.update(&(self.state as u32).to_le_bytes());
        hasher.finalize()
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let raw = RawRecord {
            seq: U32::new(self.seq),
            state: U32::new(self.state as u32),
            crc: U32::new(self.crc()),
        };
        let mut out = [0u8; RECORD_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decode a stored record.  Erased, corrupt, and rejected records all
    /// read as absent.
    pub fn decode(raw: &[u8]) -> Option<OtaRecord> {
        let (rec, _) = LayoutVerified::<_, RawRecord>::new_unaligned_from_prefix(raw)?;
        let seq = rec.seq.get();
        if seq == SEQ_ERASED {
            return None;
        }
        let state = ImageState::from_raw(rec.state.get())?;
        let record = OtaRecord { seq, state };
        if record.crc() != rec.crc.get() {
            log::warn!("otadata: record seq {} has bad CRC", seq);
            return None;
        }
        if state.is_rejected() {
            log::info!("otadata: record seq {} is {:?}", seq, state);
            return None;
        }
        Some(record)
    }
}

/// The in-memory copy of both log sectors.
#[derive(Debug, Clone)]
pub struct OtaLog {
    region: Region,
    sector: usize,
    records: [Option<OtaRecord>; 2],
}

impl OtaLog {
    pub fn read<F: Flash + ?Sized>(flash: &mut F, region: &Region) -> Result<OtaLog> {
        let sector = flash.erase_size();
        let needed = sector.checked_mul(2).ok_or(Error::InvalidLayout)?;
        if region.size < needed || region.addr % sector != 0 {
            log::error!("otadata {:#x}+{:#x} cannot hold two sectors", region.addr, region.size);
            return Err(Error::InvalidLayout);
        }

        let mut records = [None; 2];
        for (i, record) in records.iter_mut().enumerate() {
            let mut raw = [0u8; RECORD_SIZE];
            flash.read(region.addr + i * sector, &mut raw)?;
            *record = OtaRecord::decode(&raw);
        }
        Ok(OtaLog {
            region: *region,
            sector,
            records,
        })
    }

    pub fn records(&self) -> &[Option<OtaRecord>; 2] {
        &self.records
    }

    /// Index of the record in effect, if any.  A tie goes to the first.
    pub fn active(&self) -> Option<usize> {
        match self.records {
            [Some(a), Some(b)] => Some(if b.seq > a.seq { 1 } else { 0 }),
            [Some(_), None] => Some(0),
            [None, Some(_)] => Some(1),
            [None, None] => None,
        }
    }

    pub fn active_record(&self) -> Option<OtaRecord> {
        self.active().and_then(|i| self.records[i])
    }

    /// The slot the log currently selects.
    pub fn active_slot(&self, slot_count: usize) -> Option<usize> {
        if slot_count == 0 {
            return None;
        }
        let seq = self.active_record()?.seq;
        let seq = seq.checked_sub(1)? as usize;
        Some(seq % slot_count)
    }

    /// The sequence number selecting `target`: the smallest value above the
    /// active sequence for which `(seq - 1) % slot_count == target`.  With an
    /// empty log this is `target + 1`.
    pub fn next_sequence(&self, target: usize, slot_count: usize) -> Result<u32> {
        if slot_count == 0 || target >= slot_count {
            return Err(Error::InvalidLayout);
        }
        let n = slot_count as u64;
        let first = target as u64 + 1;
        let seq = match self.active_record() {
            None => first,
            Some(active) => {
                let active = active.seq as u64;
                if first > active {
                    first
                } else {
                    first + ((active - first) / n + 1) * n
                }
            }
        };
        // The erased value can never be a valid sequence.
        match u32::try_from(seq) {
            Ok(seq) if seq != SEQ_ERASED => Ok(seq),
            _ => {
                log::error!("otadata: sequence numbers exhausted");
                Err(Error::InvalidLayout)
            }
        }
    }

    /// Select `target` for the next boot.  The record goes into the sector
    /// not holding the active record, which is erased first.  Returns the
    /// new sequence number.
    pub fn commit<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        target: usize,
        slot_count: usize,
        state: ImageState,
    ) -> Result<u32> {
        let seq = self.next_sequence(target, slot_count)?;
        let index = match self.active() {
            Some(active) => 1 - active,
            None => 0,
        };

        let write_size = flash.write_size();
        let len = align_up(RECORD_SIZE, write_size).ok_or(Error::InvalidLayout)?;
        if len > sizes::MAX_WRITE_SIZE {
            return Err(Error::InvalidLayout);
        }
        let mut buf = [0xffu8; sizes::MAX_WRITE_SIZE];
        let record = OtaRecord::new(seq, state);
        buf[..RECORD_SIZE].copy_from_slice(&record.encode());

        let addr = self.region.addr + index * self.sector;
        flash.erase(addr, addr + self.sector)?;
        flash.write(addr, &buf[..len])?;
        self.records[index] = Some(record);
        log::info!(
            "otadata: slot {} selected, seq {} in sector {}",
            target,
            seq,
            index
        );
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflash::SimFlash;

    const REGION: Region = Region::new(0x2000, 0x2000);

    fn flash() -> SimFlash {
        SimFlash::new(1, 4, 4096, 4).unwrap()
    }

    fn put(flash: &mut SimFlash, sector: usize, record: OtaRecord) {
        flash
            .install(&record.encode(), REGION.addr + sector * 4096)
            .unwrap();
    }

    #[test]
    fn record_layout() {
        let rec = OtaRecord::new(5, ImageState::Undefined);
        let raw = rec.encode();
        assert_eq!(&raw[..4], &[5, 0, 0, 0]);
        assert_eq!(&raw[4..8], &[0xff; 4]);
        let mut words = [0u8; 8];
        words[..4].copy_from_slice(&5u32.to_le_bytes());
        words[4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(&raw[8..], &crc32fast::hash(&words).to_le_bytes());
        assert_eq!(OtaRecord::decode(&raw), Some(rec));
    }

    #[test]
    fn absent_records() {
        assert_eq!(OtaRecord::decode(&[0xff; RECORD_SIZE]), None);
        let mut raw = OtaRecord::new(3, ImageState::Valid).encode();
        raw[0] ^= 0x10;
        assert_eq!(OtaRecord::decode(&raw), None);
        let raw = OtaRecord::new(3, ImageState::Invalid).encode();
        assert_eq!(OtaRecord::decode(&raw), None);
        let raw = OtaRecord::new(3, ImageState::Aborted).encode();
        assert_eq!(OtaRecord::decode(&raw), None);
    }

    #[test]
    fn highest_wins() {
        let mut flash = flash();
        put(&mut flash, 0, OtaRecord::new(4, ImageState::Valid));
        put(&mut flash, 1, OtaRecord::new(5, ImageState::Undefined));
        let log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.active(), Some(1));
        assert_eq!(log.active_slot(8), Some(4));
        assert_eq!(log.active_slot(2), Some(0));
    }

    #[test]
    fn switch_slot() {
        let mut flash = flash();
        put(&mut flash, 0, OtaRecord::new(4, ImageState::Valid));
        put(&mut flash, 1, OtaRecord::new(5, ImageState::Undefined));
        let mut log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.next_sequence(7, 8), Ok(8));
        assert_eq!(log.next_sequence(5, 8), Ok(6));
        // Staying in the same slot still moves the sequence forward.
        assert_eq!(log.next_sequence(4, 8), Ok(13));

        let seq = log.commit(&mut flash, 7, 8, ImageState::New).unwrap();
        assert_eq!(seq, 8);
        // The inactive sector was replaced.
        let log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.records()[0], Some(OtaRecord::new(8, ImageState::New)));
        assert_eq!(log.records()[1], Some(OtaRecord::new(5, ImageState::Undefined)));
        assert_eq!(log.active_slot(8), Some(7));
    }

    #[test]
    fn fresh_log() {
        let mut flash = flash();
        let mut log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.active(), None);
        assert_eq!(log.active_slot(2), None);
        assert_eq!(log.commit(&mut flash, 0, 2, ImageState::Undefined), Ok(1));

        let mut log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.active(), Some(0));
        assert_eq!(log.active_slot(2), Some(0));
        // Alternating between two slots.
        assert_eq!(log.commit(&mut flash, 1, 2, ImageState::Undefined), Ok(2));
        assert_eq!(log.commit(&mut flash, 0, 2, ImageState::Undefined), Ok(3));
        let log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.active(), Some(0));
        assert_eq!(log.active_slot(2), Some(0));
    }

    #[test]
    fn rejected_record_ignored() {
        let mut flash = flash();
        put(&mut flash, 0, OtaRecord::new(2, ImageState::Valid));
        put(&mut flash, 1, OtaRecord::new(3, ImageState::Aborted));
        let log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.active(), Some(0));
        assert_eq!(log.active_slot(2), Some(1));
    }

    #[test]
    fn power_loss_keeps_old_selection() {
        let mut flash = flash();
        put(&mut flash, 0, OtaRecord::new(1, ImageState::Valid));
        let mut log = OtaLog::read(&mut flash, &REGION).unwrap();
        // The erase of the inactive sector succeeds, the write does not.
        flash.fail_after(1);
        assert!(log.commit(&mut flash, 1, 2, ImageState::New).is_err());
        flash.heal();
        let log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.active(), Some(0));
        assert_eq!(log.active_slot(2), Some(0));
    }

    #[test]
    fn bad_region() {
        let mut flash = flash();
        assert_eq!(
            OtaLog::read(&mut flash, &Region::new(0x2000, 0x1000)).unwrap_err(),
            Error::InvalidLayout
        );
        let log = OtaLog::read(&mut flash, &REGION).unwrap();
        assert_eq!(log.next_sequence(2, 2), Err(Error::InvalidLayout));
    }
}
