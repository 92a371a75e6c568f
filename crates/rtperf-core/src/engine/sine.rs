//! Built-in reference engine.
//!
//! A single wavetable oscillator with just enough of an engine surface to
//! exercise every operation in the table: command-line style options,
//! control and string channels, numbered tables, score time and an
//! in-memory file system. Offline performances are written as WAV files
//! into that file system.
//!
//! Recognised options:
//! - `-r<sr>` / `--sample-rate=<sr>`
//! - `-k<ksmps>` / `--ksmps=<ksmps>`
//! - `--nchnls=<n>`, `--nchnls_i=<n>`
//! - `-B<frames>` (hardware buffer), `-b<frames>` (software buffer)
//! - `-odac` (realtime), `-o<path>` / `--output=<path>` (offline render)
//! - `-iadc` (audio input), `-M` (realtime MIDI)
//! - `--duration=<seconds>`

use super::{BlockStatus, Engine, EngineFactory, InitializeConfig, PerformanceIo, RenderMode};
use crate::config::EngineSettings;
use crate::ops::EngineOp;
use crate::shared_state::StateField;
use crate::value::Value;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

/// Reported by `getVersion`.
pub const ENGINE_VERSION: i64 = 100;
/// Reported by `getAPIVersion`.
pub const API_VERSION: i64 = 100;

/// Table the oscillator reads its waveform from.
pub const WAVETABLE: i64 = 1;
const WAVETABLE_SIZE: usize = 1024;

/// Control channel overriding the oscillator frequency.
pub const FREQUENCY_CHANNEL: &str = "freq";
/// Control channel overriding the oscillator amplitude.
pub const AMPLITUDE_CHANNEL: &str = "amp";

pub struct SineEngine {
    initial: InitializeConfig,
    settings: EngineSettings,
    output: Option<String>,
    requesting_input: bool,
    requesting_midi: bool,
    /// Score end in seconds; `None` plays until stopped.
    duration: Option<f64>,
    score_pending: bool,
    score_offset: f64,
    frames_done: u64,
    phase: f64,
    orchestra: Vec<String>,
    control_channels: HashMap<String, f64>,
    string_channels: HashMap<String, String>,
    tables: HashMap<i64, Vec<f64>>,
    files: BTreeMap<String, Vec<u8>>,
    messages: Vec<String>,
    /// Per-block interleaved output, sized on start.
    block: Vec<f64>,
    input: Vec<f64>,
    /// Offline render accumulator.
    rendered: Vec<f32>,
    mode: RenderMode,
    /// Between a successful `start` and `cleanup`; block sizes are fixed.
    performing: bool,
}

impl SineEngine {
    /// Build an engine, applying `config.options` in order.
    pub fn new(config: &InitializeConfig) -> Result<Self> {
        let mut engine = Self {
            initial: config.clone(),
            settings: config.settings.clone(),
            output: None,
            requesting_input: config.settings.nchnls_i > 0,
            requesting_midi: false,
            duration: None,
            score_pending: true,
            score_offset: 0.0,
            frames_done: 0,
            phase: 0.0,
            orchestra: Vec::new(),
            control_channels: HashMap::new(),
            string_channels: HashMap::new(),
            tables: HashMap::new(),
            files: BTreeMap::new(),
            messages: Vec::new(),
            block: Vec::new(),
            input: Vec::new(),
            rendered: Vec::new(),
            mode: RenderMode::Realtime,
            performing: false,
        };
        engine.tables.insert(WAVETABLE, sine_table(WAVETABLE_SIZE));
        for option in &config.options {
            engine
                .set_option(option)
                .with_context(|| format!("Invalid engine option '{}'", option))?;
        }
        Ok(engine)
    }

    /// Factory suitable for [`crate::Performance::initialize`].
    pub fn factory() -> EngineFactory {
        Box::new(|config| Ok(Box::new(SineEngine::new(config)?) as Box<dyn Engine>))
    }

    /// Apply one option.
    ///
    /// While a performance runs only `--duration=` is accepted; everything
    /// else would change the shape of blocks already allocated.
    pub fn set_option(&mut self, option: &str) -> Result<()> {
        let option = option.trim();
        if self.performing && !option.starts_with("--duration=") {
            bail!("cannot change during a performance");
        }
        if let Some(v) = option
            .strip_prefix("--sample-rate=")
            .or_else(|| option.strip_prefix("-r"))
        {
            self.settings.sample_rate = parse_positive(v, "sample rate")?;
        } else if let Some(v) = option
            .strip_prefix("--ksmps=")
            .or_else(|| option.strip_prefix("-k"))
        {
            self.settings.ksmps = parse_positive(v, "ksmps")?;
        } else if let Some(v) = option.strip_prefix("--nchnls_i=") {
            self.settings.nchnls_i = v
                .parse()
                .map_err(|_| anyhow!("bad input channel count '{}'", v))?;
            self.requesting_input = self.settings.nchnls_i > 0;
        } else if let Some(v) = option.strip_prefix("--nchnls=") {
            self.settings.nchnls = parse_positive(v, "channel count")?;
        } else if let Some(v) = option.strip_prefix("-B") {
            self.settings.hardware_buffer_size = parse_positive(v, "hardware buffer size")?;
        } else if let Some(v) = option.strip_prefix("-b") {
            self.settings.software_buffer_size = parse_positive(v, "software buffer size")?;
        } else if option == "-odac" {
            self.output = None;
        } else if let Some(path) = option
            .strip_prefix("--output=")
            .or_else(|| option.strip_prefix("-o"))
        {
            if path.is_empty() {
                bail!("empty output path");
            }
            self.output = Some(path.to_string());
        } else if option == "-iadc" {
            self.requesting_input = true;
            self.settings.nchnls_i = self.settings.nchnls_i.max(1);
        } else if option.starts_with("-M") {
            self.requesting_midi = true;
        } else if let Some(v) = option.strip_prefix("--duration=") {
            let seconds: f64 = v.parse().map_err(|_| anyhow!("bad duration '{}'", v))?;
            if seconds < 0.0 {
                bail!("negative duration");
            }
            self.duration = Some(seconds);
        } else {
            bail!("unrecognised option");
        }
        Ok(())
    }

    fn score_time(&self) -> f64 {
        self.score_offset + self.frames_done as f64 / self.settings.sample_rate as f64
    }

    fn log(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Extend the score end with `i` statements (`i p1 start dur ...`).
    fn read_score(&mut self, score: &str) -> i64 {
        let mut events = 0;
        for line in score.lines().map(str::trim) {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("i") => {
                    let p: Vec<f64> = fields.filter_map(|f| f.parse().ok()).collect();
                    if let [_, start, dur, ..] = p[..] {
                        let end = start + dur;
                        self.duration = Some(self.duration.map_or(end, |d| d.max(end)));
                        events += 1;
                    }
                }
                Some("e") => self.duration = Some(self.duration.unwrap_or(0.0)),
                _ => {}
            }
        }
        self.score_pending = true;
        self.log(format!("read {} score events", events));
        0
    }

    fn compile_csd(&mut self, csd: &str) -> Result<i64> {
        if let Some(options) = section(csd, "CsOptions") {
            for option in options.split_whitespace() {
                self.set_option(option)
                    .with_context(|| format!("Invalid option '{}' in CsOptions", option))?;
            }
        }
        if let Some(orc) = section(csd, "CsInstruments") {
            self.orchestra.push(orc.to_string());
        }
        if let Some(sco) = section(csd, "CsScore") {
            self.read_score(sco);
        }
        Ok(0)
    }

    fn table(&self, table: i64) -> Result<&Vec<f64>> {
        self.tables
            .get(&table)
            .ok_or_else(|| anyhow!("table {} does not exist", table))
    }

    fn oscillator(&mut self, frame_count: usize, channels: usize) {
        let sr = self.settings.sample_rate as f64;
        let frequency = self
            .control_channels
            .get(FREQUENCY_CHANNEL)
            .copied()
            .unwrap_or(self.settings.frequency);
        let amplitude = self
            .control_channels
            .get(AMPLITUDE_CHANNEL)
            .copied()
            .unwrap_or(self.settings.amplitude);
        let table = self.tables.get(&WAVETABLE).filter(|t| !t.is_empty());
        let increment = frequency / sr;

        for frame in 0..frame_count {
            let sample = match table {
                Some(t) => t[((self.phase * t.len() as f64) as usize).min(t.len() - 1)],
                None => 0.0,
            } * amplitude;
            for ch in 0..channels {
                let monitor = self.input.get(frame * channels + ch).copied().unwrap_or(0.0);
                self.block[frame * channels + ch] = sample + monitor;
            }
            self.phase = (self.phase + increment).fract();
        }
    }

    fn encode_render(&mut self) -> Result<()> {
        let Some(path) = self.output.clone() else {
            return Ok(());
        };
        let spec = hound::WavSpec {
            channels: self.settings.nchnls as u16,
            sample_rate: self.settings.sample_rate as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for sample in &self.rendered {
                writer.write_sample(*sample)?;
            }
            writer.finalize()?;
        }
        let frames = self.rendered.len() / self.settings.nchnls.max(1) as usize;
        self.files.insert(path.clone(), cursor.into_inner());
        self.rendered.clear();
        self.log(format!("wrote {} frames to {}", frames, path));
        Ok(())
    }
}

impl Engine for SineEngine {
    fn start(&mut self, io: &PerformanceIo) -> Result<i32> {
        let s = &self.settings;
        let state = &io.state;
        state.set(StateField::SampleRate, s.sample_rate);
        state.set(StateField::Ksmps, s.ksmps);
        state.set(StateField::Nchnls, s.nchnls);
        state.set(StateField::NchnlsI, s.nchnls_i);
        state.set(StateField::HwBufferSize, s.hardware_buffer_size);
        state.set(StateField::SwBufferSize, s.software_buffer_size);
        state.set(StateField::IsRequestingRtmidi, self.requesting_midi as i32);
        state.set(StateField::IsRequestingMic, self.requesting_input as i32);

        let samples = (s.ksmps * s.nchnls) as usize;
        if samples > io.audio.output.capacity() {
            self.log(format!(
                "block of {} samples does not fit the output ring ({})",
                samples,
                io.audio.output.capacity()
            ));
            return Ok(-1);
        }
        self.block = vec![0.0; samples];
        self.input = if self.requesting_input {
            vec![0.0; samples]
        } else {
            Vec::new()
        };
        self.mode = if self.output.is_some() {
            RenderMode::Offline
        } else {
            RenderMode::Realtime
        };
        self.frames_done = 0;
        self.rendered.clear();
        self.performing = true;
        let message = format!(
            "starting {} performance: sr {}, ksmps {}, nchnls {}",
            if self.mode == RenderMode::Offline { "offline" } else { "realtime" },
            s.sample_rate,
            s.ksmps,
            s.nchnls
        );
        self.log(message);
        Ok(0)
    }

    fn mode(&self) -> RenderMode {
        self.mode
    }

    fn perform_block(&mut self, io: &PerformanceIo) -> Result<BlockStatus> {
        if let Some(end) = self.duration {
            if self.score_time() >= end {
                return Ok(BlockStatus::Finished);
            }
        }
        let frames = self.settings.ksmps as usize;
        let channels = self.settings.nchnls as usize;

        if self.mode == RenderMode::Realtime && !self.input.is_empty() {
            let read = io.audio.input.read(&mut self.input);
            self.input[read..].iter_mut().for_each(|s| *s = 0.0);
        }
        self.oscillator(frames, channels);

        match self.mode {
            RenderMode::Realtime => io.audio.output.write(&self.block),
            RenderMode::Offline => self.rendered.extend(self.block.iter().map(|&s| s as f32)),
        }
        self.frames_done += frames as u64;
        Ok(BlockStatus::Continue)
    }

    fn cleanup(&mut self, _io: &PerformanceIo) -> Result<()> {
        self.performing = false;
        if self.mode == RenderMode::Offline {
            self.encode_render().context("Failed to write render output")?;
        }
        self.log(format!("performance ended at {:.3}s", self.score_time()));
        Ok(())
    }

    fn reset(&mut self) -> Result<i32> {
        let files = std::mem::take(&mut self.files);
        let mut fresh = SineEngine::new(&self.initial)?;
        fresh.files = files;
        *self = fresh;
        self.log("engine reset");
        Ok(0)
    }

    fn call(&mut self, op: EngineOp, args: &[Value]) -> Result<Value> {
        let value = match op {
            EngineOp::CompileCsd => Value::Int(self.compile_csd(str_arg(args, 0)?)?),
            EngineOp::CompileOrc => {
                let orc = str_arg(args, 0)?;
                if orc.trim().is_empty() {
                    Value::Int(-1)
                } else {
                    self.orchestra.push(orc.to_string());
                    Value::Int(0)
                }
            }
            EngineOp::EvalCode => {
                let code = str_arg(args, 0)?.trim();
                let code = code.strip_prefix("return").unwrap_or(code).trim();
                Value::Float(code.parse().unwrap_or(0.0))
            }
            EngineOp::ReadScore | EngineOp::InputMessage => {
                Value::Int(self.read_score(str_arg(args, 0)?))
            }
            EngineOp::SetOption => {
                let option = str_arg(args, 0)?.to_string();
                match self.set_option(&option) {
                    Ok(()) => Value::Int(0),
                    Err(e) => {
                        self.log(format!("option '{}' rejected: {}", option, e));
                        Value::Int(-1)
                    }
                }
            }
            EngineOp::GetSr => Value::Float(self.settings.sample_rate as f64),
            EngineOp::GetKsmps => Value::Int(self.settings.ksmps as i64),
            EngineOp::GetNchnls => Value::Int(self.settings.nchnls as i64),
            EngineOp::GetNchnlsInput => Value::Int(self.settings.nchnls_i as i64),
            EngineOp::Get0dBFS => Value::Float(1.0),
            EngineOp::GetControlChannel => {
                let name = str_arg(args, 0)?;
                Value::Float(self.control_channels.get(name).copied().unwrap_or(0.0))
            }
            EngineOp::SetControlChannel => {
                let name = str_arg(args, 0)?.to_string();
                self.control_channels.insert(name, f64_arg(args, 1)?);
                Value::Unit
            }
            EngineOp::GetStringChannel => {
                let name = str_arg(args, 0)?;
                Value::Str(self.string_channels.get(name).cloned().unwrap_or_default())
            }
            EngineOp::SetStringChannel => {
                let name = str_arg(args, 0)?.to_string();
                self.string_channels.insert(name, str_arg(args, 1)?.to_string());
                Value::Unit
            }
            EngineOp::GetScoreTime => Value::Float(self.score_time()),
            EngineOp::IsScorePending => Value::from(self.score_pending),
            EngineOp::SetScorePending => {
                self.score_pending = int_arg(args, 0)? != 0;
                Value::Unit
            }
            EngineOp::RewindScore => {
                self.frames_done = 0;
                Value::Unit
            }
            EngineOp::GetScoreOffsetSeconds => Value::Float(self.score_offset),
            EngineOp::SetScoreOffsetSeconds => {
                self.score_offset = f64_arg(args, 0)?;
                Value::Unit
            }
            EngineOp::TableLength => Value::Int(
                self.tables
                    .get(&int_arg(args, 0)?)
                    .map_or(-1, |t| t.len() as i64),
            ),
            EngineOp::TableGet => {
                let index = int_arg(args, 1)?;
                let table = self.table(int_arg(args, 0)?)?;
                let sample = usize::try_from(index)
                    .ok()
                    .and_then(|i| table.get(i))
                    .ok_or_else(|| anyhow!("index {} out of range", index))?;
                Value::Float(*sample)
            }
            EngineOp::TableSet => {
                let number = int_arg(args, 0)?;
                let index = int_arg(args, 1)?;
                let value = f64_arg(args, 2)?;
                let table = self
                    .tables
                    .get_mut(&number)
                    .ok_or_else(|| anyhow!("table {} does not exist", number))?;
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| table.get_mut(i))
                    .ok_or_else(|| anyhow!("index {} out of range", index))?;
                *slot = value;
                Value::Unit
            }
            EngineOp::GetVersion => Value::Int(ENGINE_VERSION),
            EngineOp::GetApiVersion => Value::Int(API_VERSION),
            EngineOp::WriteToFs => {
                let path = str_arg(args, 0)?.to_string();
                let data = args
                    .get(1)
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| anyhow!("argument 2 must be bytes"))?;
                self.files.insert(path, data.to_vec());
                Value::Unit
            }
            EngineOp::ReadFromFs => {
                let path = str_arg(args, 0)?;
                let data = self
                    .files
                    .get(path)
                    .ok_or_else(|| anyhow!("no such file: {}", path))?;
                Value::Bytes(data.clone())
            }
            EngineOp::LsFs => {
                Value::List(self.files.keys().map(|k| Value::from(k.as_str())).collect())
            }
            EngineOp::LlFs => Value::List(
                self.files
                    .iter()
                    .map(|(path, data)| {
                        Value::List(vec![Value::from(path.as_str()), Value::Int(data.len() as i64)])
                    })
                    .collect(),
            ),
            EngineOp::RmrfFs => {
                let path = str_arg(args, 0)?;
                let prefix = format!("{}/", path.trim_end_matches('/'));
                let before = self.files.len();
                self.files.retain(|k, _| k != path && !k.starts_with(&prefix));
                Value::Int((before - self.files.len()) as i64)
            }
        };
        Ok(value)
    }

    fn drain_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

fn sine_table(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| (i as f64 / size as f64 * std::f64::consts::TAU).sin())
        .collect()
}

fn parse_positive(value: &str, what: &str) -> Result<i32> {
    match value.parse::<i32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => bail!("bad {} '{}'", what, value),
    }
}

/// Body of `<tag>...</tag>`, if present.
fn section<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

fn str_arg(args: &[Value], i: usize) -> Result<&str> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("argument {} must be a string", i + 1))
}

fn int_arg(args: &[Value], i: usize) -> Result<i64> {
    args.get(i)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("argument {} must be an integer", i + 1))
}

fn f64_arg(args: &[Value], i: usize) -> Result<f64> {
    args.get(i)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("argument {} must be a number", i + 1))
}
