use super::apu::Apu;
use super::gbs::{GbsError, GbsHeader};

const BANK_SIZE: usize = 0x4000;
const MAX_BANKS: usize = 32;

/// Trait representing a piece of memory in the system that can have bytes read and written to.
/// write/read words are just composed from write/read byte, so implementors only need to implement
/// `read_byte` and `write_byte`.
pub trait Memory {
    fn read_byte(&self, addr: u16) -> u8;
    fn read_word(&self, addr: u16) -> u16 {
        u16::from(self.read_byte(addr)) | (u16::from(self.read_byte(addr.wrapping_add(1))) << 8)
    }
    fn write_byte(&mut self, addr: u16, val: u8);
    fn write_word(&mut self, addr: u16, val: u16) {
        self.write_byte(addr, (val & 0xFF) as u8);
        self.write_byte(addr.wrapping_add(1), (val >> 8) as u8);
    }
}

/// The address-decoded memory bus seen by the music driver.
///
/// Only the regions a GBS driver can legitimately touch are backed:
/// ROM banks (bank 0 fixed, one switchable window), working RAM, high
/// RAM, and the audio register block. Everything else reads as 0xFF and
/// swallows writes.
pub struct Mmu {
    /// Up to 32 ROM banks of 16 KiB, sparsely populated from the file body
    banks: Vec<Option<Box<[u8]>>>,
    /// Bank currently mapped at 0x4000..=0x7FFF
    bank_sel: usize,
    /// Working RAM, 0xA000..=0xDFFF
    wram: Box<[u8]>,
    /// High RAM, 0xFF80..=0xFFFE
    hram: [u8; 0x7F],
    pub apu: Apu,
}

impl Mmu {
    /// Builds the bus from a parsed header and the file body following it.
    /// Loads the ROM image at `load_addr`, filling successive banks until
    /// the body runs out, then brings the audio registers and wave RAM to
    /// their power-on state.
    pub fn power_on(header: &GbsHeader, body: &[u8], sample_rate: u32) -> Result<Self, GbsError> {
        let mut banks: Vec<Option<Box<[u8]>>> = (0..MAX_BANKS).map(|_| None).collect();

        let mut bno = usize::from(header.load_addr) / BANK_SIZE;
        let mut off = usize::from(header.load_addr) % BANK_SIZE;
        let mut pos = 0;
        while pos < body.len() {
            if bno >= MAX_BANKS {
                return Err(GbsError::TooManyBanks);
            }
            let mut bank = vec![0u8; BANK_SIZE].into_boxed_slice();
            let n = (BANK_SIZE - off).min(body.len() - pos);
            bank[off..off + n].copy_from_slice(&body[pos..pos + n]);
            banks[bno] = Some(bank);
            pos += n;
            off = 0;
            bno += 1;
        }
        info!(
            "Loaded {} ROM bank(s) at 0x{:04X}",
            banks.iter().filter(|b| b.is_some()).count(),
            header.load_addr
        );

        let mut mmu = Mmu {
            banks,
            bank_sel: 1,
            wram: vec![0u8; 0x4000].into_boxed_slice(),
            hram: [0; 0x7F],
            apu: Apu::power_on(sample_rate),
        };

        // Timer registers drive the play-routine rate
        mmu.write_byte(0xFF06, header.tma);
        mmu.write_byte(0xFF07, header.tac);

        // Power-on image of NR10..NR52, written through the normal
        // register path so channel state tracks it
        const REGS_INIT: [u8; 23] = [
            0x80, 0xBF, 0xF3, 0xFF, 0x3F, 0xFF, 0x3F, 0x00, 0xFF, 0x3F, 0x7F, 0xFF, 0x9F, 0xFF,
            0x3F, 0xFF, 0xFF, 0x00, 0x00, 0x3F, 0x77, 0xF3, 0xF1,
        ];
        for (i, v) in REGS_INIT.iter().enumerate() {
            mmu.write_byte(0xFF10 + i as u16, *v);
        }

        // Power-on wave pattern RAM
        const WAVE_INIT: [u8; 16] = [
            0xAC, 0xDD, 0xDA, 0x48, 0x36, 0x02, 0xCF, 0x16, 0x2C, 0x04, 0xE5, 0x2C, 0xAC, 0xDD,
            0xDA, 0x48,
        ];
        for (i, v) in WAVE_INIT.iter().enumerate() {
            mmu.write_byte(0xFF30 + i as u16, *v);
        }

        Ok(mmu)
    }

    /// Selects the ROM bank mapped at 0x4000..=0x7FFF. Bank 0 and banks
    /// that were never loaded are ignored; some drivers write junk here.
    fn bank_switch(&mut self, which: u8) {
        let which = usize::from(which);
        if which > 0 && which < MAX_BANKS && self.banks[which].is_some() {
            self.bank_sel = which;
        } else if which != 0 {
            warn!("Ignoring switch to unloaded ROM bank {}", which);
        }
    }
}

impl Memory for Mmu {
    fn read_byte(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => match &self.banks[0] {
                Some(bank) => bank[usize::from(addr)],
                None => 0xFF,
            },
            0x4000..=0x7FFF => match &self.banks[self.bank_sel] {
                Some(bank) => bank[usize::from(addr) - BANK_SIZE],
                None => 0xFF,
            },
            0xA000..=0xDFFF => self.wram[usize::from(addr) - 0xA000],
            0xFF06..=0xFF3F => self.apu.read_byte(addr),
            0xFF80..=0xFFFE => self.hram[usize::from(addr) - 0xFF80],
            _ => 0xFF,
        }
    }

    fn write_byte(&mut self, addr: u16, val: u8) {
        match addr {
            0x2000..=0x3FFF => self.bank_switch(val),
            // ROM is read-only outside the bank-select window
            0x0000..=0x1FFF | 0x4000..=0x7FFF => (),
            0xA000..=0xDFFF => self.wram[usize::from(addr) - 0xA000] = val,
            0xFF06..=0xFF3F => self.apu.write_byte(addr, val),
            0xFF80..=0xFFFE => self.hram[usize::from(addr) - 0xFF80] = val,
            _ => debug!("Dropped write of {:02X} at unmapped {:04X}", val, addr),
        }
    }
}
