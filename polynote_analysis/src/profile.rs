//! Flat binary persistence for learned note templates.
//!
//! File layout, all little-endian: 4-byte magic `PNPF`, u32 format version,
//! u32 profile count, then per profile `{ i32 midi_note, u32 spectrum_len,
//! f32[spectrum_len] }`. Float bit patterns survive a save/load round trip
//! exactly. Labels and guitar positions are derived data and not persisted.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::util::midi_note_name;

pub const PROFILE_MAGIC: [u8; 4] = *b"PNPF";
pub const PROFILE_FORMAT_VERSION: u32 = 1;

// bounds for fields read from disk, checked before any allocation
const MAX_PROFILES: u32 = 128;
const MAX_SPECTRUM_LEN: u32 = 1 << 20;

/// Averaged, L2-normalized magnitude-spectrum fingerprint of one MIDI note.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralProfile {
    pub midi_note: u8,
    pub spectrum: Vec<f32>,
    /// Note name in scientific pitch notation, e. g. "C4".
    pub label: String,
    pub guitar_string: Option<u8>,
    pub guitar_fret: Option<u8>,
}

pub fn save_profiles(path: &Path, profiles: &[SpectralProfile]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    writer.write_all(&PROFILE_MAGIC)?;
    writer.write_u32::<LittleEndian>(PROFILE_FORMAT_VERSION)?;
    writer.write_u32::<LittleEndian>(profiles.len() as u32)?;

    for profile in profiles {
        writer.write_i32::<LittleEndian>(profile.midi_note as i32)?;
        writer.write_u32::<LittleEndian>(profile.spectrum.len() as u32)?;
        for &value in &profile.spectrum {
            writer.write_f32::<LittleEndian>(value)?;
        }
    }

    writer.flush()?;
    debug!("saved {} profiles to {}", profiles.len(), path.display());
    Ok(())
}

/// Reads a template file written by [`save_profiles`]. Malformed or
/// truncated files yield an error without ever panicking or allocating
/// unbounded memory; the caller's current profiles are not touched.
pub fn load_profiles(path: &Path) -> io::Result<Vec<SpectralProfile>> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != PROFILE_MAGIC {
        return Err(invalid_data("not a polynote profile file"));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != PROFILE_FORMAT_VERSION {
        return Err(invalid_data(format!(
            "unsupported profile format version {version}"
        )));
    }

    let count = reader.read_u32::<LittleEndian>()?;
    if count > MAX_PROFILES {
        return Err(invalid_data(format!("implausible profile count {count}")));
    }

    let mut profiles = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let midi_note = reader.read_i32::<LittleEndian>()?;
        if !(0..=127).contains(&midi_note) {
            return Err(invalid_data(format!("midi note {midi_note} out of range")));
        }
        let midi_note = midi_note as u8;

        let len = reader.read_u32::<LittleEndian>()?;
        if len > MAX_SPECTRUM_LEN {
            return Err(invalid_data(format!("implausible spectrum length {len}")));
        }
        let mut spectrum = vec![0.0f32; len as usize];
        reader.read_f32_into::<LittleEndian>(&mut spectrum)?;

        profiles.push(SpectralProfile {
            midi_note,
            spectrum,
            label: midi_note_name(midi_note),
            guitar_string: None,
            guitar_fret: None,
        });
    }

    debug!("loaded {} profiles from {}", profiles.len(), path.display());
    Ok(profiles)
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
