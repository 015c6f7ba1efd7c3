use super::mmu::Memory;

const DMG_CLOCK_FREQ: f32 = 4_194_304.0;
const SCREEN_REFRESH_CYCLES: f32 = 70_224.0;
const VERTICAL_SYNC: f32 = DMG_CLOCK_FREQ / SCREEN_REFRESH_CYCLES;

/// First and last bus addresses serviced by the APU, inclusive.
const AUDIO_ADDR_START: u16 = 0xFF06;
const AUDIO_ADDR_END: u16 = 0xFF3F;
const AUDIO_MEM_SIZE: usize = (AUDIO_ADDR_END - AUDIO_ADDR_START + 1) as usize;

/// Unused register bits read back as ones, one mask per address in
/// NR10..=NR52 (0xFF10..=0xFF26).
const READ_OR_MASK: [u8; 23] = [
    0x80, 0x3F, 0x00, 0xFF, 0xBF, 0xFF, 0x3F, 0x00, 0xFF, 0xBF, 0x7F, 0xFF, 0x9F, 0xFF, 0xBF,
    0xFF, 0xFF, 0x00, 0x00, 0xBF, 0x00, 0x00, 0x70,
];

fn reg_idx(addr: u16) -> usize {
    usize::from(addr - AUDIO_ADDR_START)
}

/// Length counter: when enabled, counts up at a rate derived from the
/// programmed load and disables the channel when it crosses 1.0.
#[derive(Default)]
struct LengthCounter {
    load: u16,
    enabled: bool,
    counter: f32,
    inc: f32,
}

/// Volume envelope: periodic ±1 volume ramp for channels 1, 2 and 4.
#[derive(Default)]
struct VolumeEnvelope {
    step: u8,
    up: bool,
    counter: f32,
    inc: f32,
}

/// Frequency sweep, channel 1 only. `freq` holds the frequency
/// snapshotted at the trigger; each tick shifts that snapshot and
/// applies it to the live frequency.
#[derive(Default)]
struct FreqSweep {
    freq: u16,
    rate: u8,
    up: bool,
    shift: u8,
    counter: f32,
    inc: f32,
}

/// State for one of the four voices. The square, wave and noise
/// channels share the common front half; the generator-specific fields
/// at the end are only meaningful for their own channel.
struct Channel {
    /// Actively producing output. Gated by triggers, the length counter,
    /// sweep overflow and DAC power.
    enabled: bool,
    /// DAC power. A channel whose DAC is off is silent no matter what,
    /// and cannot be enabled.
    powered: bool,
    on_left: bool,
    on_right: bool,
    /// User-requested mute, separate from anything the driver does
    muted: bool,

    /// Current output volume 0..=15, or the 2-bit attenuation code for
    /// the wave channel
    volume: u8,
    volume_init: u8,

    /// Raw 11-bit frequency register value. The noise channel reuses
    /// this field for its clock-shift amount.
    freq: u16,
    freq_counter: f32,
    freq_inc: f32,

    /// Current bipolar output level of the generator
    val: i32,

    len: LengthCounter,
    env: VolumeEnvelope,
    sweep: FreqSweep,

    /// High-pass filter state
    capacitor: f32,

    // square
    duty: u8,
    duty_counter: u8,

    // noise
    lfsr_reg: u16,
    lfsr_wide: bool,
    lfsr_div: u8,

    // wave
    sample: u8,
}

impl Default for Channel {
    fn default() -> Self {
        Channel {
            enabled: false,
            powered: false,
            on_left: false,
            on_right: false,
            muted: false,
            volume: 0,
            volume_init: 0,
            freq: 0,
            freq_counter: 0.0,
            freq_inc: 0.0,
            val: 0,
            len: LengthCounter::default(),
            env: VolumeEnvelope::default(),
            sweep: FreqSweep::default(),
            capacitor: 0.0,
            duty: 0,
            duty_counter: 0,
            lfsr_reg: 0,
            lfsr_wide: false,
            lfsr_div: 0,
            sample: 0,
        }
    }
}

impl Channel {
    /// Converts a tone frequency in Hz into the per-output-sample phase
    /// increment the generators step by.
    fn set_note_freq(&mut self, freq: f32, sample_rate: f32) {
        self.freq_inc = freq / sample_rate;
    }

    /// One frame-slot of the volume envelope. Saturating at either end
    /// freezes the envelope until the next trigger.
    fn update_env(&mut self) {
        self.env.counter += self.env.inc;
        while self.env.counter > 1.0 {
            if self.env.step != 0 {
                if self.env.up {
                    self.volume = (self.volume + 1).min(15);
                } else {
                    self.volume = self.volume.saturating_sub(1);
                }
                if self.volume == 0 || self.volume == 15 {
                    self.env.inc = 0.0;
                }
            }
            self.env.counter -= 1.0;
        }
    }

    /// One frame-slot of the frequency sweep. The shifted step always
    /// comes from the trigger-time snapshot, not the live frequency.
    /// Overflow past the 11-bit range kills the channel; a programmed
    /// rate with a zero shift kills it on the first tick.
    fn update_sweep(&mut self, sample_rate: f32) {
        self.sweep.counter += self.sweep.inc;
        while self.sweep.counter > 1.0 {
            if self.sweep.shift != 0 {
                let step = self.sweep.freq >> self.sweep.shift;
                let step = if self.sweep.up { step } else { step.wrapping_neg() };
                self.freq = self.freq.wrapping_add(step);
                if self.freq > 2047 {
                    self.enabled = false;
                } else {
                    let freq =
                        DMG_CLOCK_FREQ / (((2048 - i32::from(self.freq)) << 5) as f32);
                    self.set_note_freq(freq, sample_rate);
                    self.freq_inc *= 8.0;
                }
            } else if self.sweep.rate != 0 {
                self.enabled = false;
            }
            self.sweep.counter -= 1.0;
        }
    }

    /// Advances the phase accumulator towards the next generator step.
    /// Returns true each time a step lands inside the current output
    /// sample, leaving `pos` at the fraction of the sample consumed so
    /// far; the callers use the before/after fractions to split the
    /// step's amplitude between adjacent samples.
    fn update_freq(&mut self, pos: &mut f32) -> bool {
        let inc = self.freq_inc - *pos;
        self.freq_counter += inc;
        if self.freq_counter > 1.0 {
            *pos = self.freq_inc - (self.freq_counter - 1.0);
            self.freq_counter = 0.0;
            true
        } else {
            *pos = self.freq_inc;
            false
        }
    }

    /// DC-blocking high-pass: `out = in - cap; cap = in - out * decay`.
    fn hipass(&mut self, sample: f32, decay: f32) -> f32 {
        let out = sample - self.capacitor;
        self.capacitor = sample - out * decay;
        out
    }
}

/// The four-voice synthesizer. Owns the register mirror for
/// 0xFF06..=0xFF3F, all channel state, and the ring of interleaved
/// stereo samples the audio callback drains. All methods run on the
/// audio thread; the CPU reaches the APU only through the bus.
pub struct Apu {
    /// Raw byte mirror of 0xFF06..=0xFF3F, including wave pattern RAM
    regs: [u8; AUDIO_MEM_SIZE],
    chans: [Channel; 4],
    vol_l: f32,
    vol_r: f32,
    sample_rate: f32,
    /// High-pass coefficient, 0.996 at 48 kHz and rescaled elsewhere to
    /// keep the same cutoff
    hipass_decay: f32,
    /// One driver frame's worth of interleaved stereo samples
    samples: Vec<f32>,
    /// Drain cursor; at `samples.len()` the ring is empty
    read_pos: usize,
}

impl Apu {
    pub fn power_on(sample_rate: u32) -> Self {
        let sample_rate = sample_rate as f32;
        let mut apu = Apu {
            regs: [0; AUDIO_MEM_SIZE],
            chans: Default::default(),
            vol_l: 0.0,
            vol_r: 0.0,
            sample_rate,
            hipass_decay: 0.996f32.powf(48_000.0 / sample_rate),
            samples: Vec::new(),
            read_pos: 0,
        };
        apu.chans[0].val = -1;
        apu.chans[1].val = -1;
        apu.update_rate();
        apu
    }

    /// Recomputes the driver invocation rate from TMA/TAC and resizes
    /// the ring to hold exactly one frame at that rate. With the timer
    /// disabled the rate falls back to the vertical sync rate.
    fn update_rate(&mut self) {
        let tma = self.regs[reg_idx(0xFF06)];
        let tac = self.regs[reg_idx(0xFF07)];

        let mut rate = VERTICAL_SYNC;
        if tac & 0x04 != 0 {
            const RATES: [f32; 4] = [4_096.0, 262_144.0, 65_536.0, 16_384.0];
            rate = RATES[usize::from(tac & 0x03)] / (256 - i32::from(tma)) as f32;
            if tac & 0x80 != 0 {
                rate *= 2.0;
            }
        }

        // Never allocate an empty ring: a degenerate TMA/TAC pair must
        // not be able to wedge the pull loop.
        let pairs = ((self.sample_rate / rate) as usize).max(1);
        self.samples = vec![0.0; pairs * 2];
        self.read_pos = self.samples.len();
        debug!("Driver rate {:.2} Hz, {} samples per frame", rate, pairs * 2);
    }

    /// Flips a channel's enable state, mirroring it into the NR52
    /// status bits.
    fn chan_enable(&mut self, i: usize, enable: bool) {
        self.chans[i].enabled = enable;
        let mut val = self.regs[reg_idx(0xFF26)] & 0x80;
        for (n, c) in self.chans.iter().enumerate() {
            if c.enabled {
                val |= 1 << n;
            }
        }
        self.regs[reg_idx(0xFF26)] = val;
    }

    /// One frame-slot of a channel's length counter.
    fn update_len(&mut self, i: usize) {
        if self.chans[i].len.enabled {
            self.chans[i].len.counter += self.chans[i].len.inc;
            if self.chans[i].len.counter > 1.0 {
                self.chan_enable(i, false);
                self.chans[i].len.counter = 0.0;
            }
        }
    }

    /// Restarts channel `i`: reload volume, rearm the envelope from its
    /// register, snapshot the sweep (channel 1), reset the generator
    /// position, and rearm the length counter.
    fn chan_trigger(&mut self, i: usize) {
        self.chan_enable(i, true);

        let sample_rate = self.sample_rate;
        let env_val = self.regs[reg_idx(0xFF12) + i * 5];
        let sweep_val = self.regs[reg_idx(0xFF10)];
        let c = &mut self.chans[i];

        c.volume = c.volume_init;

        c.env.step = env_val & 0x07;
        c.env.up = env_val & 0x08 != 0;
        c.env.inc = if c.env.step != 0 {
            (64.0 / f32::from(c.env.step)) / sample_rate
        } else {
            8.0 / sample_rate
        };
        c.env.counter = 0.0;

        if i == 0 {
            c.sweep.freq = c.freq;
            c.sweep.rate = (sweep_val >> 4) & 0x07;
            c.sweep.up = sweep_val & 0x08 == 0;
            c.sweep.shift = sweep_val & 0x07;
            c.sweep.inc = if c.sweep.rate != 0 {
                (128.0 / f32::from(c.sweep.rate)) / sample_rate
            } else {
                0.0
            };
            // Just past 1.0, so the first tick fires on the next slot
            c.sweep.counter = 1.0 + f32::EPSILON;
        }

        let mut len_max = 64.0;
        if i == 2 {
            len_max = 256.0;
            c.val = 0;
        } else if i == 3 {
            c.lfsr_reg = 0xFFFF;
            c.val = -1;
        }
        c.len.inc = (256.0 / (len_max - f32::from(c.len.load))) / sample_rate;
        c.len.counter = 0.0;
    }

    /// Generates one frame of a square channel into the ring.
    fn update_square(&mut self, ch2: bool) {
        let i = usize::from(ch2);
        if !self.chans[i].powered {
            return;
        }

        let freq = DMG_CLOCK_FREQ / (((2048 - i32::from(self.chans[i].freq)) << 5) as f32);
        let sample_rate = self.sample_rate;
        {
            let c = &mut self.chans[i];
            c.set_note_freq(freq, sample_rate);
            c.freq_inc *= 8.0;
        }

        for s in (0..self.samples.len()).step_by(2) {
            self.update_len(i);
            if !self.chans[i].enabled {
                continue;
            }
            self.chans[i].update_env();
            if !ch2 {
                self.chans[i].update_sweep(sample_rate);
            }

            let decay = self.hipass_decay;
            let (out, on_left, on_right, muted) = {
                let c = &mut self.chans[i];
                let mut pos = 0.0;
                let mut prev_pos = 0.0;
                let mut sample = 0.0;
                while c.update_freq(&mut pos) {
                    c.duty_counter = (c.duty_counter + 1) & 0b111;
                    sample += ((pos - prev_pos) / c.freq_inc) * c.val as f32;
                    c.val = if c.duty & (1 << c.duty_counter) != 0 { 1 } else { -1 };
                    prev_pos = pos;
                }
                sample += ((pos - prev_pos) / c.freq_inc) * c.val as f32;
                let out = c.hipass(sample * (f32::from(c.volume) / 15.0), decay);
                (out, c.on_left, c.on_right, c.muted)
            };

            if !muted {
                if on_left {
                    self.samples[s] += out * 0.25 * self.vol_l;
                }
                if on_right {
                    self.samples[s + 1] += out * 0.25 * self.vol_r;
                }
            }
        }
    }

    /// Generates one frame of the wave channel into the ring.
    fn update_wave(&mut self) {
        if !self.chans[2].powered {
            return;
        }

        let freq = DMG_CLOCK_FREQ / (((2048 - i32::from(self.chans[2].freq)) << 5) as f32);
        let sample_rate = self.sample_rate;
        {
            let c = &mut self.chans[2];
            c.set_note_freq(freq, sample_rate);
            c.freq_inc *= 16.0;
        }

        // Wave RAM cannot change while a frame is generated (the CPU
        // only runs between frames), so one snapshot serves the frame.
        let mut wave = [0u8; 16];
        wave.copy_from_slice(&self.regs[reg_idx(0xFF30)..reg_idx(0xFF30) + 16]);

        for s in (0..self.samples.len()).step_by(2) {
            self.update_len(2);
            if !self.chans[2].enabled {
                continue;
            }

            let decay = self.hipass_decay;
            let (out, on_left, on_right, muted) = {
                let c = &mut self.chans[2];
                let mut pos = 0.0;
                let mut prev_pos = 0.0;
                let mut sample = 0.0;
                c.sample = wave_sample(&wave, c.val as u32, c.volume);
                while c.update_freq(&mut pos) {
                    c.val = (c.val + 1) & 31;
                    sample += ((pos - prev_pos) / c.freq_inc) * f32::from(c.sample);
                    c.sample = wave_sample(&wave, c.val as u32, c.volume);
                    prev_pos = pos;
                }
                sample += ((pos - prev_pos) / c.freq_inc) * f32::from(c.sample);

                if c.volume > 0 {
                    // Centre the unsigned nibble stream around zero for
                    // each attenuation level before filtering
                    const DC_OFFSETS: [f32; 3] = [7.5, 3.75, 1.5];
                    let diff = DC_OFFSETS[usize::from(c.volume) - 1];
                    let out = c.hipass((sample - diff) / 7.5, decay);
                    (Some(out), c.on_left, c.on_right, c.muted)
                } else {
                    (None, c.on_left, c.on_right, c.muted)
                }
            };

            if let Some(out) = out {
                if !muted {
                    if on_left {
                        self.samples[s] += out * 0.25 * self.vol_l;
                    }
                    if on_right {
                        self.samples[s + 1] += out * 0.25 * self.vol_r;
                    }
                }
            }
        }
    }

    /// Generates one frame of the noise channel into the ring.
    fn update_noise(&mut self) {
        if !self.chans[3].powered {
            return;
        }

        const DIVISORS: [u32; 8] = [8, 16, 32, 48, 64, 80, 96, 112];
        let shift = self.chans[3].freq;
        let freq =
            DMG_CLOCK_FREQ / ((DIVISORS[usize::from(self.chans[3].lfsr_div)] << shift) as f32);
        let sample_rate = self.sample_rate;
        self.chans[3].set_note_freq(freq, sample_rate);

        if shift >= 14 {
            self.chans[3].enabled = false;
        }

        for s in (0..self.samples.len()).step_by(2) {
            self.update_len(3);
            if !self.chans[3].enabled {
                continue;
            }
            self.chans[3].update_env();

            let decay = self.hipass_decay;
            let (out, on_left, on_right, muted) = {
                let c = &mut self.chans[3];
                let mut pos = 0.0;
                let mut prev_pos = 0.0;
                let mut sample = 0.0;
                while c.update_freq(&mut pos) {
                    c.lfsr_reg = (c.lfsr_reg << 1) | u16::from(c.val == 1);
                    let taps = if c.lfsr_wide {
                        (c.lfsr_reg >> 14) ^ (c.lfsr_reg >> 13)
                    } else {
                        (c.lfsr_reg >> 6) ^ (c.lfsr_reg >> 5)
                    };
                    c.val = if taps & 1 == 0 { 1 } else { -1 };
                    sample += ((pos - prev_pos) / c.freq_inc) * c.val as f32;
                    prev_pos = pos;
                }
                sample += ((pos - prev_pos) / c.freq_inc) * c.val as f32;
                let out = c.hipass(sample * (f32::from(c.volume) / 15.0), decay);
                (out, c.on_left, c.on_right, c.muted)
            };

            if !muted {
                if on_left {
                    self.samples[s] += out * 0.25 * self.vol_l;
                }
                if on_right {
                    self.samples[s + 1] += out * 0.25 * self.vol_r;
                }
            }
        }
    }

    /// Synthesizes one full driver frame into the ring and marks it
    /// ready to drain.
    pub fn run_frame(&mut self) {
        for s in self.samples.iter_mut() {
            *s = 0.0;
        }
        self.update_square(false);
        self.update_square(true);
        self.update_wave();
        self.update_noise();
        self.read_pos = 0;
    }

    /// Fills the ring with silence instead of running the generators,
    /// used when a driver frame had to be abandoned.
    pub fn run_silent_frame(&mut self) {
        for s in self.samples.iter_mut() {
            *s = 0.0;
        }
        self.read_pos = 0;
    }

    /// Interleaved sample count of one frame at the current rate.
    pub fn frame_samples(&self) -> usize {
        self.samples.len()
    }

    /// True when every generated sample has been drained.
    pub fn is_empty(&self) -> bool {
        self.read_pos >= self.samples.len()
    }

    /// Copies ring samples into `out` from the drain cursor, returning
    /// how many were copied.
    pub fn drain(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.samples.len() - self.read_pos);
        out[..n].copy_from_slice(&self.samples[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        n
    }

    /// Mutes or unmutes one voice without touching driver state.
    pub fn set_muted(&mut self, chan: usize, muted: bool) {
        if let Some(c) = self.chans.get_mut(chan) {
            c.muted = muted;
        }
    }
}

/// Picks the 4-bit sample at `pos` out of a wave RAM snapshot, high
/// nibble first, attenuated by the 2-bit volume code.
fn wave_sample(wave: &[u8; 16], pos: u32, volume: u8) -> u8 {
    let mut sample = wave[(pos / 2) as usize];
    if pos & 1 != 0 {
        sample &= 0x0F;
    } else {
        sample >>= 4;
    }
    if volume > 0 {
        sample >> (volume - 1)
    } else {
        0
    }
}

impl Memory for Apu {
    fn read_byte(&self, addr: u16) -> u8 {
        debug_assert!((AUDIO_ADDR_START..=AUDIO_ADDR_END).contains(&addr));
        let val = self.regs[reg_idx(addr)];
        if (0xFF10..=0xFF26).contains(&addr) {
            val | READ_OR_MASK[usize::from(addr - 0xFF10)]
        } else {
            val
        }
    }

    fn write_byte(&mut self, addr: u16, val: u8) {
        debug_assert!((AUDIO_ADDR_START..=AUDIO_ADDR_END).contains(&addr));

        // Channel index for the per-channel register groups
        let ch = usize::from(addr.saturating_sub(0xFF10)) / 5;

        // The mirror retains every store; reads come back from here
        self.regs[reg_idx(addr)] = val;

        match addr {
            // Timer registers select the driver invocation rate
            0xFF06 | 0xFF07 => self.update_rate(),

            // Volume envelope / DAC power for channels 1, 2, 4
            0xFF12 | 0xFF17 | 0xFF21 => {
                let c = &mut self.chans[ch];
                c.volume_init = val >> 4;
                c.powered = (val >> 3) != 0;

                // "Zombie mode": live volume manipulation through the
                // envelope register, relied upon by several drivers
                if c.powered && c.enabled {
                    if c.env.step == 0 && c.env.inc != 0.0 {
                        if val & 0x08 != 0 {
                            c.volume = c.volume.wrapping_add(1);
                        } else {
                            c.volume = c.volume.wrapping_add(2);
                        }
                    } else {
                        c.volume = 16u8.wrapping_sub(c.volume);
                    }
                    c.volume &= 0x0F;
                    c.env.step = val & 0x07;
                }

                if !self.chans[ch].powered {
                    self.chan_enable(ch, false);
                }
            }

            // Wave channel output level code
            0xFF1C => {
                let c = &mut self.chans[ch];
                c.volume = (val >> 5) & 0x03;
                c.volume_init = c.volume;
            }

            // Length load and duty for channels 1, 2, 4
            0xFF11 | 0xFF16 | 0xFF20 => {
                const DUTY_LOOKUP: [u8; 4] = [0x10, 0x30, 0x3C, 0xCF];
                let c = &mut self.chans[ch];
                c.len.load = u16::from(val & 0x3F);
                c.duty = DUTY_LOOKUP[usize::from(val >> 6)];
            }

            // Wave channel length load uses the full byte
            0xFF1B => self.chans[ch].len.load = u16::from(val),

            // Frequency low bytes
            0xFF13 | 0xFF18 | 0xFF1D => {
                let c = &mut self.chans[ch];
                c.freq = (c.freq & 0xFF00) | u16::from(val);
            }

            // Wave channel DAC power
            0xFF1A => {
                let powered = val & 0x80 != 0;
                self.chans[ch].powered = powered;
                self.chan_enable(ch, powered);
            }

            // Frequency high bits, length enable, trigger
            0xFF14 | 0xFF19 | 0xFF1E => {
                {
                    let c = &mut self.chans[ch];
                    c.freq = (c.freq & 0x00FF) | (u16::from(val & 0x07) << 8);
                }
                self.chans[ch].len.enabled = val & 0x40 != 0;
                if val & 0x80 != 0 {
                    self.chan_trigger(ch);
                }
            }

            // Noise has no frequency register, only length/trigger
            0xFF23 => {
                self.chans[3].len.enabled = val & 0x40 != 0;
                if val & 0x80 != 0 {
                    self.chan_trigger(3);
                }
            }

            // Noise clock shift, LFSR width, divisor
            0xFF22 => {
                {
                    let c = &mut self.chans[3];
                    c.freq = u16::from(val >> 4);
                    c.lfsr_wide = val & 0x08 == 0;
                    c.lfsr_div = val & 0x07;
                }
                // Shifts past 13 stop the LFSR clock entirely
                if val >> 4 >= 14 {
                    self.chan_enable(3, false);
                }
            }

            // Master volumes, 3 bits per side
            0xFF24 => {
                self.vol_l = f32::from((val >> 4) & 0x07) / 7.0;
                self.vol_r = f32::from(val & 0x07) / 7.0;
            }

            // Stereo routing, one bit per channel per side
            0xFF25 => {
                for (n, c) in self.chans.iter_mut().enumerate() {
                    c.on_left = (val >> (4 + n)) & 1 != 0;
                    c.on_right = (val >> n) & 1 != 0;
                }
            }

            // Everything else (NR52 master bit, wave RAM, the scratch
            // bytes below NR10) only lives in the mirror
            _ => (),
        }
    }
}

#[cfg(test)]
mod apu_tests {
    use super::*;

    const SR: u32 = 48_000;

    /// Frame length in interleaved samples at the vertical sync rate
    const VSYNC_FRAME: usize = 803 * 2;

    fn test_apu() -> Apu {
        let mut apu = Apu::power_on(SR);
        // Full volume, all channels routed both sides
        apu.write_byte(0xFF24, 0x77);
        apu.write_byte(0xFF25, 0xFF);
        apu
    }

    #[test]
    fn ring_sized_from_timer_registers() {
        let mut apu = test_apu();
        assert_eq!(apu.samples.len(), VSYNC_FRAME);

        // TAC bit 2 selects the timer: 4096 Hz base / (256 - 0) = 16 Hz
        apu.write_byte(0xFF07, 0x04);
        assert_eq!(apu.samples.len(), (SR as usize / 16) * 2);

        // Doubled when TAC bit 7 is set
        apu.write_byte(0xFF07, 0x84);
        assert_eq!(apu.samples.len(), (SR as usize / 32) * 2);
    }

    #[test]
    fn read_or_mask_applied() {
        let mut apu = test_apu();
        apu.write_byte(0xFF11, 0x00);
        assert_eq!(apu.read_byte(0xFF11), 0x3F);
        apu.write_byte(0xFF11, 0x80);
        assert_eq!(apu.read_byte(0xFF11), 0x80 | 0x3F);

        // With every register cleared, reads return exactly the
        // unused-bit mask
        for addr in 0xFF10..=0xFF26u16 {
            apu.write_byte(addr, 0x00);
        }
        for addr in 0xFF10..=0xFF26u16 {
            assert_eq!(
                apu.read_byte(addr),
                READ_OR_MASK[usize::from(addr - 0xFF10)],
                "at {:04X}",
                addr
            );
        }
    }

    #[test]
    fn wave_ram_reads_back_raw() {
        let mut apu = test_apu();
        for (n, addr) in (0xFF30..=0xFF3Fu16).enumerate() {
            apu.write_byte(addr, n as u8 * 0x11);
        }
        for (n, addr) in (0xFF30..=0xFF3Fu16).enumerate() {
            assert_eq!(apu.read_byte(addr), n as u8 * 0x11);
        }
    }

    #[test]
    fn square_tone_reaches_both_sides() {
        let mut apu = test_apu();
        apu.write_byte(0xFF11, 0x80); // 50% duty
        apu.write_byte(0xFF12, 0xF0); // volume 15, no envelope
        apu.write_byte(0xFF14, 0x80); // trigger, frequency code 0

        // Accumulate several frames so partial-period imbalance and the
        // filter's settling transient stop dominating the average
        let mut acc: Vec<f32> = Vec::new();
        for _ in 0..64 {
            apu.run_frame();
            acc.extend_from_slice(&apu.samples);
        }

        let left: Vec<f32> = acc.iter().step_by(2).copied().collect();
        let right: Vec<f32> = acc.iter().skip(1).step_by(2).copied().collect();
        for side in [&left, &right] {
            assert!(side.iter().any(|&s| s > 0.05));
            assert!(side.iter().any(|&s| s < -0.05));
            let mean: f32 = side.iter().sum::<f32>() / side.len() as f32;
            assert!(mean.abs() < 0.01, "DC offset {} after high-pass", mean);
        }
    }

    #[test]
    fn zombie_write_bumps_volume() {
        let mut apu = test_apu();
        apu.write_byte(0xFF12, 0xE0); // volume 14, step 0
        apu.write_byte(0xFF14, 0x80); // trigger
        assert_eq!(apu.chans[0].volume, 14);

        // Envelope register write on a live channel with step 0:
        // direction bit set bumps the volume by exactly one
        apu.write_byte(0xFF12, 0xE8);
        assert_eq!(apu.chans[0].volume, 15);
    }

    #[test]
    fn noise_shift_14_disables_channel() {
        let mut apu = test_apu();
        apu.write_byte(0xFF21, 0xF0);
        apu.write_byte(0xFF23, 0x80);
        assert!(apu.chans[3].enabled);

        apu.write_byte(0xFF22, 0xE0); // shift 14
        assert!(!apu.chans[3].enabled);
        assert_eq!(apu.read_byte(0xFF26) & 0x08, 0);
    }

    #[test]
    fn length_counter_expires_on_schedule() {
        let mut apu = test_apu();
        apu.write_byte(0xFF16, 0x20); // length load 32
        apu.write_byte(0xFF17, 0xF0);
        apu.write_byte(0xFF19, 0xC0); // trigger with length enabled

        // (64 - 32) / 256 seconds is 6000 sample pairs, which falls in
        // the 8th vertical-sync frame of 803 pairs
        for _ in 0..7 {
            apu.run_frame();
        }
        assert!(apu.chans[1].enabled);
        apu.run_frame();
        assert!(!apu.chans[1].enabled);
        assert_eq!(apu.read_byte(0xFF26) & 0x02, 0);
    }

    #[test]
    fn powering_down_dac_disables_channel() {
        let mut apu = test_apu();
        apu.write_byte(0xFF12, 0xF0);
        apu.write_byte(0xFF14, 0x80);
        assert!(apu.chans[0].enabled && apu.chans[0].powered);

        apu.write_byte(0xFF12, 0x00);
        assert!(!apu.chans[0].powered);
        assert!(!apu.chans[0].enabled);
        assert_eq!(apu.read_byte(0xFF26) & 0x01, 0);
    }

    #[test]
    fn envelope_volume_stays_in_range() {
        let mut apu = test_apu();
        apu.write_byte(0xFF12, 0x11); // volume 1, decreasing, step 1
        apu.write_byte(0xFF14, 0x80);
        for _ in 0..32 {
            apu.run_frame();
            assert!(apu.chans[0].volume <= 15);
        }
        // Envelope bottomed out and froze
        assert_eq!(apu.chans[0].volume, 0);
        assert_eq!(apu.chans[0].env.inc, 0.0);
    }

    #[test]
    fn wave_volume_code_is_two_bits() {
        let mut apu = test_apu();
        for val in [0x00u8, 0x20, 0x40, 0x60, 0xE0] {
            apu.write_byte(0xFF1C, val);
            assert!(apu.chans[2].volume <= 3);
            assert_eq!(apu.chans[2].volume, (val >> 5) & 0x03);
        }
    }

    #[test]
    fn sweep_overflow_silences_channel() {
        let mut apu = test_apu();
        // Maximum frequency with an additive sweep, rate 1, shift 1:
        // the first sweep tick pushes the frequency past 2047
        apu.write_byte(0xFF10, 0x11);
        apu.write_byte(0xFF11, 0x80);
        apu.write_byte(0xFF12, 0xF0);
        apu.write_byte(0xFF13, 0xFF);
        apu.write_byte(0xFF14, 0x87); // trigger, frequency 0x7FF
        assert!(apu.chans[0].enabled);

        // 128/rate Hz sweep clock: well under one frame of samples
        apu.run_frame();
        assert!(!apu.chans[0].enabled);
    }
}
