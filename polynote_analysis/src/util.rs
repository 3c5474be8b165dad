pub fn arg_max(sl: &[f32]) -> usize {
    // we have no NaNs
    sl.iter()
        .enumerate()
        .fold(
            (0, f32::MIN),
            |cur, x| if *x.1 > cur.1 { (x.0, *x.1) } else { cur },
        )
        .0
}

/// Scales `vec` to unit L2 norm in place. A zero vector is left untouched so
/// that silence never turns into NaNs further down the pipeline.
pub fn normalize(vec: &mut [f32]) {
    let sum_squares: f32 = vec.iter().map(|x| x * x).sum();
    if sum_squares > 0.0 {
        let norm = sum_squares.sqrt();
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Name of a MIDI note in scientific pitch notation, e. g. 60 -> "C4".
pub fn midi_note_name(midi_note: u8) -> String {
    const NOTE_NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    let octave = (midi_note / 12) as i32 - 1;
    format!("{}{}", NOTE_NAMES[(midi_note % 12) as usize], octave)
}
