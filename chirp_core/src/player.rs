use super::cpu::Cpu;
use super::gbs::{GbsError, GbsHeader, HEADER_SIZE};
use super::mmu::Mmu;

/// Upper bound on instructions executed for one INIT or PLAY call.
/// The frame boundary is "SP rises back to the header SP", so a driver
/// that misuses SP could otherwise spin forever inside the audio
/// callback; past this point the frame is abandoned as silence.
const FRAME_STEP_LIMIT: u32 = 1_000_000;

/// Runs a GBS music driver: owns the CPU, the bus, and the header's
/// entry-point protocol, and produces the stereo stream the audio
/// backend pulls.
///
/// The driver is re-entered once per frame at its PLAY address with SP
/// dropped by one return slot; its terminal RET pops that slot and the
/// step loop stops when SP matches the header SP again. This replaces
/// the timer interrupt a real Game Boy would deliver.
pub struct Player {
    cpu: Cpu,
    mmu: Mmu,
    header: GbsHeader,
}

impl Player {
    /// Parses `data` as a GBS file and builds the emulated system around
    /// it. The sample rate is whatever the audio backend negotiated.
    pub fn power_on(data: &[u8], sample_rate: u32) -> Result<Self, GbsError> {
        let header = GbsHeader::parse(data)?;
        let mmu = Mmu::power_on(&header, &data[HEADER_SIZE..], sample_rate)?;
        let cpu = Cpu::power_on(header.load_addr);
        info!(
            "\"{}\" by {}, {} song(s)",
            header.title, header.author, header.song_count
        );
        Ok(Player { cpu, mmu, header })
    }

    pub fn header(&self) -> &GbsHeader {
        &self.header
    }

    /// Number of interleaved samples one driver frame produces at the
    /// current TMA/TAC rate. Useful for sizing host-side buffers.
    pub fn frame_samples(&self) -> usize {
        self.mmu.apu.frame_samples()
    }

    /// Calls the driver's INIT routine for `song` (0-based) on a fresh
    /// register file: PC at the init address, A carrying the song index,
    /// and SP one return slot below the header SP so the terminal RET
    /// surfaces at the match point.
    pub fn run_init(&mut self, song: u8) -> Result<(), GbsError> {
        if song >= self.header.song_count {
            return Err(GbsError::SongOutOfRange {
                requested: song,
                count: self.header.song_count,
            });
        }
        self.cpu
            .reset(self.header.init_addr, self.header.sp.wrapping_sub(2), song);
        self.run_until_return();
        Ok(())
    }

    /// Calls the driver's PLAY routine once, then synthesizes the audio
    /// frame the register writes described.
    pub fn run_frame(&mut self) {
        self.cpu.reg.pc = self.header.play_addr;
        self.cpu.reg.sp = self.cpu.reg.sp.wrapping_sub(2);
        if self.run_until_return() {
            self.mmu.apu.run_frame();
        } else {
            self.mmu.apu.run_silent_frame();
        }
    }

    /// Steps the CPU until SP rises back to the header SP. Returns false
    /// if the instruction cap was hit, after resynchronizing SP so the
    /// next frame starts from a sane stack.
    fn run_until_return(&mut self) -> bool {
        for _ in 0..FRAME_STEP_LIMIT {
            if self.cpu.reg.sp == self.header.sp {
                return true;
            }
            self.cpu.step(&mut self.mmu);
        }
        warn!(
            "Driver did not return within {} instructions, dropping frame",
            FRAME_STEP_LIMIT
        );
        self.cpu.reg.sp = self.header.sp;
        false
    }

    /// Pull contract for the audio backend: fills `out` completely with
    /// interleaved stereo samples, running driver frames whenever the
    /// ring empties.
    pub fn fill(&mut self, out: &mut [f32]) {
        let mut filled = 0;
        while filled < out.len() {
            if self.mmu.apu.is_empty() {
                self.run_frame();
            }
            filled += self.mmu.apu.drain(&mut out[filled..]);
        }
    }

    /// Mutes or unmutes one of the four voices.
    pub fn set_muted(&mut self, chan: usize, muted: bool) {
        self.mmu.apu.set_muted(chan, muted);
    }
}

#[cfg(test)]
mod player_tests {
    use super::*;
    use crate::gbs;

    /// Builds an in-memory GBS image whose INIT and PLAY routines are
    /// single RET instructions.
    fn ret_image() -> Vec<u8> {
        let mut data = vec![0u8; gbs::HEADER_SIZE];
        data[0..3].copy_from_slice(b"GBS");
        data[3] = 1;
        data[4] = 2; // songs
        data[5] = 1; // start song
        data[6..8].copy_from_slice(&0x0400u16.to_le_bytes()); // load
        data[8..10].copy_from_slice(&0x0400u16.to_le_bytes()); // init
        data[10..12].copy_from_slice(&0x0410u16.to_le_bytes()); // play
        data[12..14].copy_from_slice(&0xE000u16.to_le_bytes()); // sp
        let mut body = vec![0u8; 0x20];
        body[0x00] = 0xC9; // 0x0400: RET
        body[0x10] = 0xC9; // 0x0410: RET
        data.extend_from_slice(&body);
        data
    }

    #[test]
    fn init_returns_to_header_sp() {
        let mut player = Player::power_on(&ret_image(), 48_000).unwrap();
        player.run_init(0).unwrap();
        assert_eq!(player.cpu.reg.sp, 0xE000);
    }

    #[test]
    fn init_rejects_out_of_range_song() {
        let mut player = Player::power_on(&ret_image(), 48_000).unwrap();
        assert!(matches!(
            player.run_init(2),
            Err(GbsError::SongOutOfRange { .. })
        ));
    }

    #[test]
    fn frames_restore_sp() {
        let mut player = Player::power_on(&ret_image(), 48_000).unwrap();
        player.run_init(0).unwrap();
        for _ in 0..4 {
            player.run_frame();
            assert_eq!(player.cpu.reg.sp, 0xE000);
        }
    }

    #[test]
    fn wedged_driver_yields_silent_frame() {
        let mut data = ret_image();
        // Replace PLAY with a tight loop: JR -2
        let play = gbs::HEADER_SIZE + 0x10;
        data[play] = 0x18;
        data[play + 1] = 0xFE;

        let mut player = Player::power_on(&data, 48_000).unwrap();
        player.run_init(0).unwrap();
        player.run_frame();
        // SP was resynchronized and the frame came out silent
        assert_eq!(player.cpu.reg.sp, 0xE000);
        let mut buf = vec![1.0f32; 64];
        let n = player.mmu.apu.drain(&mut buf);
        assert_eq!(n, 64);
        assert!(buf.iter().all(|&s| s == 0.0));
    }
}
