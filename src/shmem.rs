//! The shared audio buffer: a file-backed memory region both processes map.
//!
//! The region starts with a fixed header recording the agreed bus layout;
//! the body is a flat array of per-bus, per-channel sample runs whose
//! offsets are computable from the header alone, so no pointer fixup is
//! ever needed across the process boundary. Offsets stay stable for the
//! lifetime of one configuration; reconfiguring requires both sides to be
//! quiescent (audio disabled) first.
//!
//! The buffer itself carries no lock. The request/ack round-trip on the
//! process channel linearises all access: the foreign host only touches the
//! region while servicing a request.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

const SHM_MAGIC: u32 = 0x7742_6d53; // "SmBw"
const MAX_BUSES: usize = 16;

/// Byte offset where sample runs begin. Cache-line aligned, past the header.
const DATA_OFFSET: usize = 256;

/// Agreed bus configuration for one audio engine activation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AudioShmConfig {
    /// Bytes per sample: 4 for single precision, 8 for double.
    pub element_size: u32,
    /// Maximum frames per processing block.
    pub max_block_size: u32,
    /// Channel count of each input bus.
    pub inputs: Vec<u32>,
    /// Channel count of each output bus.
    pub outputs: Vec<u32>,
}

impl AudioShmConfig {
    /// Byte length of one channel run.
    fn run_len(&self) -> usize {
        self.max_block_size as usize * self.element_size as usize
    }

    fn channels_before(buses: &[u32], bus: usize) -> usize {
        buses[..bus].iter().map(|&c| c as usize).sum()
    }

    /// Offset of an input channel's sample run.
    pub fn input_offset(&self, bus: usize, channel: usize) -> usize {
        assert!(bus < self.inputs.len() && channel < self.inputs[bus] as usize);
        DATA_OFFSET + (Self::channels_before(&self.inputs, bus) + channel) * self.run_len()
    }

    /// Offset of an output channel's sample run. Outputs follow all inputs.
    pub fn output_offset(&self, bus: usize, channel: usize) -> usize {
        assert!(bus < self.outputs.len() && channel < self.outputs[bus] as usize);
        let input_channels: usize = self.inputs.iter().map(|&c| c as usize).sum();
        DATA_OFFSET
            + (input_channels + Self::channels_before(&self.outputs, bus) + channel)
                * self.run_len()
    }

    /// Total byte length of the mapped region.
    pub fn byte_len(&self) -> usize {
        let channels: usize =
            self.inputs.iter().chain(self.outputs.iter()).map(|&c| c as usize).sum();
        DATA_OFFSET + channels * self.run_len()
    }

    fn validate(&self) -> Result<()> {
        let ok = (self.element_size == 4 || self.element_size == 8)
            && self.max_block_size > 0
            && self.inputs.len() <= MAX_BUSES
            && self.outputs.len() <= MAX_BUSES;
        if ok {
            Ok(())
        } else {
            Err(BridgeError::Protocol("invalid audio buffer configuration"))
        }
    }

    fn write_header(&self, map: &mut [u8]) {
        let mut words = vec![
            SHM_MAGIC,
            self.element_size,
            self.max_block_size,
            self.inputs.len() as u32,
            self.outputs.len() as u32,
        ];
        words.extend(self.inputs.iter().copied());
        words.resize(5 + MAX_BUSES, 0);
        words.extend(self.outputs.iter().copied());
        words.resize(5 + 2 * MAX_BUSES, 0);
        for (i, word) in words.iter().enumerate() {
            map[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
    }

    fn read_header(map: &[u8]) -> Result<AudioShmConfig> {
        let word = |i: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&map[i * 4..i * 4 + 4]);
            u32::from_le_bytes(bytes)
        };
        if map.len() < DATA_OFFSET || word(0) != SHM_MAGIC {
            return Err(BridgeError::Protocol("bad audio buffer header"));
        }
        let num_inputs = word(3) as usize;
        let num_outputs = word(4) as usize;
        if num_inputs > MAX_BUSES || num_outputs > MAX_BUSES {
            return Err(BridgeError::Protocol("bad audio buffer header"));
        }
        let config = AudioShmConfig {
            element_size: word(1),
            max_block_size: word(2),
            inputs: (0..num_inputs).map(|i| word(5 + i)).collect(),
            outputs: (0..num_outputs).map(|i| word(5 + MAX_BUSES + i)).collect(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Descriptor the foreign host returns when the audio engine is enabled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AudioShmDescriptor {
    /// File name inside the socket group directory.
    pub file_name: String,
    /// Layout both sides agreed on.
    pub config: AudioShmConfig,
}

/// One side's mapping of the shared audio region.
pub struct AudioShmBuffer {
    config: AudioShmConfig,
    map: MmapMut,
    path: PathBuf,
}

impl AudioShmBuffer {
    /// Create the backing file, size it for `config` and map it.
    pub fn create(path: &Path, config: AudioShmConfig) -> Result<AudioShmBuffer> {
        config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(config.byte_len() as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        config.write_header(&mut map);
        Ok(AudioShmBuffer { config, map, path: path.to_path_buf() })
    }

    /// Map an existing region and validate its header.
    pub fn open(path: &Path) -> Result<AudioShmBuffer> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let config = AudioShmConfig::read_header(&map)?;
        if map.len() < config.byte_len() {
            return Err(BridgeError::Protocol("audio buffer shorter than its header claims"));
        }
        Ok(AudioShmBuffer { config, map, path: path.to_path_buf() })
    }

    /// Resize for a new configuration. Only legal while both sides are
    /// quiescent; the caller owns that coordination.
    pub fn reconfigure(&mut self, config: AudioShmConfig) -> Result<()> {
        config.validate()?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(config.byte_len() as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        config.write_header(&mut map);
        self.map = map;
        self.config = config;
        Ok(())
    }

    /// The active configuration.
    pub fn config(&self) -> &AudioShmConfig {
        &self.config
    }

    fn run_f32(&self, offset: usize, frames: usize) -> &[f32] {
        assert_eq!(self.config.element_size, 4);
        assert!(frames <= self.config.max_block_size as usize);
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset) as *const f32, frames) }
    }

    fn run_f32_mut(&mut self, offset: usize, frames: usize) -> &mut [f32] {
        assert_eq!(self.config.element_size, 4);
        assert!(frames <= self.config.max_block_size as usize);
        unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(offset) as *mut f32, frames)
        }
    }

    fn run_f64(&self, offset: usize, frames: usize) -> &[f64] {
        assert_eq!(self.config.element_size, 8);
        assert!(frames <= self.config.max_block_size as usize);
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset) as *const f64, frames) }
    }

    fn run_f64_mut(&mut self, offset: usize, frames: usize) -> &mut [f64] {
        assert_eq!(self.config.element_size, 8);
        assert!(frames <= self.config.max_block_size as usize);
        unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(offset) as *mut f64, frames)
        }
    }

    /// Input run, single precision.
    pub fn input_f32(&self, bus: usize, channel: usize, frames: usize) -> &[f32] {
        self.run_f32(self.config.input_offset(bus, channel), frames)
    }

    /// Mutable input run, single precision.
    pub fn input_f32_mut(&mut self, bus: usize, channel: usize, frames: usize) -> &mut [f32] {
        self.run_f32_mut(self.config.input_offset(bus, channel), frames)
    }

    /// Output run, single precision.
    pub fn output_f32(&self, bus: usize, channel: usize, frames: usize) -> &[f32] {
        self.run_f32(self.config.output_offset(bus, channel), frames)
    }

    /// Mutable output run, single precision.
    pub fn output_f32_mut(&mut self, bus: usize, channel: usize, frames: usize) -> &mut [f32] {
        self.run_f32_mut(self.config.output_offset(bus, channel), frames)
    }

    /// Input run, double precision.
    pub fn input_f64(&self, bus: usize, channel: usize, frames: usize) -> &[f64] {
        self.run_f64(self.config.input_offset(bus, channel), frames)
    }

    /// Mutable input run, double precision.
    pub fn input_f64_mut(&mut self, bus: usize, channel: usize, frames: usize) -> &mut [f64] {
        self.run_f64_mut(self.config.input_offset(bus, channel), frames)
    }

    /// Output run, double precision.
    pub fn output_f64(&self, bus: usize, channel: usize, frames: usize) -> &[f64] {
        self.run_f64(self.config.output_offset(bus, channel), frames)
    }

    /// Mutable output run, double precision.
    pub fn output_f64_mut(&mut self, bus: usize, channel: usize, frames: usize) -> &mut [f64] {
        self.run_f64_mut(self.config.output_offset(bus, channel), frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_config() -> AudioShmConfig {
        AudioShmConfig {
            element_size: 4,
            max_block_size: 64,
            inputs: vec![2],
            outputs: vec![2],
        }
    }

    #[test]
    fn offsets_are_stable_and_disjoint() {
        let config = stereo_config();
        let offsets = [
            config.input_offset(0, 0),
            config.input_offset(0, 1),
            config.output_offset(0, 0),
            config.output_offset(0, 1),
        ];
        // Recomputing yields identical offsets.
        assert_eq!(offsets[0], config.input_offset(0, 0));
        assert_eq!(offsets[2], config.output_offset(0, 0));
        // Runs are contiguous and non-overlapping.
        for pair in offsets.windows(2) {
            assert_eq!(pair[1] - pair[0], 64 * 4);
        }
        assert_eq!(config.byte_len(), offsets[3] + 64 * 4);
    }

    #[test]
    fn multi_bus_offsets_account_for_preceding_buses() {
        let config = AudioShmConfig {
            element_size: 8,
            max_block_size: 32,
            inputs: vec![2, 1],
            outputs: vec![2],
        };
        let run = 32 * 8;
        assert_eq!(config.input_offset(1, 0) - config.input_offset(0, 0), 2 * run);
        assert_eq!(config.output_offset(0, 0) - config.input_offset(0, 0), 3 * run);
    }

    #[test]
    fn both_mappings_see_the_same_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.shm");
        let mut native = AudioShmBuffer::create(&path, stereo_config()).unwrap();
        let mut foreign = AudioShmBuffer::open(&path).unwrap();
        assert_eq!(foreign.config(), native.config());

        native.input_f32_mut(0, 0, 64).fill(1.0);
        native.input_f32_mut(0, 1, 64).fill(-1.0);

        // Foreign side passes inputs through to outputs.
        for channel in 0..2 {
            let samples: Vec<f32> = foreign.input_f32(0, channel, 64).to_vec();
            foreign.output_f32_mut(0, channel, 64).copy_from_slice(&samples);
        }

        assert!(native.output_f32(0, 0, 64).iter().all(|&s| s == 1.0));
        assert!(native.output_f32(0, 1, 64).iter().all(|&s| s == -1.0));
    }

    #[test]
    fn reconfigure_changes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.shm");
        let mut buffer = AudioShmBuffer::create(&path, stereo_config()).unwrap();
        let old_len = buffer.config().byte_len();
        buffer
            .reconfigure(AudioShmConfig {
                element_size: 8,
                max_block_size: 128,
                inputs: vec![2],
                outputs: vec![2],
            })
            .unwrap();
        assert!(buffer.config().byte_len() > old_len);
        let reopened = AudioShmBuffer::open(&path).unwrap();
        assert_eq!(reopened.config().element_size, 8);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.shm");
        std::fs::write(&path, vec![0u8; 512]).unwrap();
        assert!(AudioShmBuffer::open(&path).is_err());
    }
}
