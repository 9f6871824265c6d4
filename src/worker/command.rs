//! Launch command line of the acquisition worker.
//!
//! ```text
//! <exec> -s <stream> -u <unit> -c <channel> -l <loops> -N <buffers> [-8] [-U] [-t] [-R] [-W <w> -H <h>]
//! ```
//!
//! `-W`/`-H` are only emitted for workers that cannot learn the geometry from
//! the hardware (the simulated worker).

use std::fmt;

use clap::Parser;

use crate::error::{AppResult, CamstackError};

/// Flags accepted by acquisition workers, as clap sees them.
#[derive(Parser, Debug)]
#[command(name = "camstack-simworker", about = "Acquisition worker", long_about = None)]
pub struct WorkerArgs {
    /// Output stream name
    #[arg(short = 's')]
    pub stream: String,
    /// Framegrabber unit
    #[arg(short = 'u', default_value_t = 0)]
    pub unit: u32,
    /// Framegrabber channel
    #[arg(short = 'c', default_value_t = 0)]
    pub channel: u32,
    /// Frames to grab, 0 for free-run
    #[arg(short = 'l', default_value_t = 0)]
    pub loop_count: u32,
    /// Ring buffers
    #[arg(short = 'N', default_value_t = 4)]
    pub n_buffers: u32,
    /// Cast byte pairs to uint16
    #[arg(short = '8')]
    pub cast_to_u16: bool,
    /// Keep unsigned output
    #[arg(short = 'U')]
    pub unsigned: bool,
    /// Embed the grab timestamp
    #[arg(short = 't')]
    pub timestamp: bool,
    /// Reuse the existing stream segment
    #[arg(short = 'R')]
    pub reuse_stream: bool,
    /// Frame width for workers that cannot query the hardware
    #[arg(short = 'W')]
    pub width: Option<u32>,
    /// Frame height for workers that cannot query the hardware
    #[arg(short = 'H')]
    pub height: Option<u32>,
}

impl WorkerArgs {
    fn into_command(self, exec: String) -> WorkerCommand {
        WorkerCommand {
            exec,
            stream: self.stream,
            unit: self.unit,
            channel: self.channel,
            loop_count: self.loop_count,
            n_buffers: self.n_buffers,
            cast_to_u16: self.cast_to_u16,
            unsigned: self.unsigned,
            timestamp: self.timestamp,
            reuse_stream: self.reuse_stream,
            width: self.width,
            height: self.height,
        }
    }
}

/// Command line of one worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable
    pub exec: String,
    /// `-s`: output stream
    pub stream: String,
    /// `-u`: framegrabber unit
    pub unit: u32,
    /// `-c`: framegrabber channel
    pub channel: u32,
    /// 0 is free-run
    pub loop_count: u32,
    /// `-N`: ring buffers
    pub n_buffers: u32,
    /// `-8`: byte pairs cast to uint16 at grab
    pub cast_to_u16: bool,
    /// `-U`: keep unsigned output
    pub unsigned: bool,
    /// `-t`: microsecond grab timestamp embedded at pixel 8
    pub timestamp: bool,
    /// `-R`: reuse the existing stream segment
    pub reuse_stream: bool,
    /// `-W`: frame width
    pub width: Option<u32>,
    /// `-H`: frame height
    pub height: Option<u32>,
}

impl WorkerCommand {
    /// Free-running worker on unit 0, channel 0, four buffers.
    pub fn new(exec: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            exec: exec.into(),
            stream: stream.into(),
            unit: 0,
            channel: 0,
            loop_count: 0,
            n_buffers: 4,
            cast_to_u16: false,
            unsigned: false,
            timestamp: false,
            reuse_stream: false,
            width: None,
            height: None,
        }
    }

    /// `-u` and `-c`.
    pub fn with_unit(mut self, unit: u32, channel: u32) -> Self {
        self.unit = unit;
        self.channel = channel;
        self
    }

    /// `-W` and `-H`.
    pub fn with_geometry(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// `-R`.
    pub fn reusing_stream(mut self, reuse: bool) -> Self {
        self.reuse_stream = reuse;
        self
    }

    /// Arguments after the executable.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            self.stream.clone(),
            "-u".to_string(),
            self.unit.to_string(),
            "-c".to_string(),
            self.channel.to_string(),
            "-l".to_string(),
            self.loop_count.to_string(),
            "-N".to_string(),
            self.n_buffers.to_string(),
        ];
        if self.cast_to_u16 {
            args.push("-8".into());
        }
        if self.unsigned {
            args.push("-U".into());
        }
        if self.timestamp {
            args.push("-t".into());
        }
        if self.reuse_stream {
            args.push("-R".into());
        }
        if let Some(w) = self.width {
            args.push("-W".into());
            args.push(w.to_string());
        }
        if let Some(h) = self.height {
            args.push("-H".into());
            args.push(h.to_string());
        }
        args
    }

    /// Space-separated line sent to the session.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Parse a full argv (`exec` first).
    pub fn parse<I, S>(argv: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let argv: Vec<String> = argv.into_iter().map(|a| a.as_ref().to_string()).collect();
        let exec = argv
            .first()
            .cloned()
            .ok_or_else(|| CamstackError::Configuration("empty worker command".into()))?;
        let args = WorkerArgs::try_parse_from(&argv)
            .map_err(|e| CamstackError::Configuration(format!("worker command: {e}")))?;
        Ok(args.into_command(exec))
    }

    /// Parse a rendered command line.
    pub fn parse_line(line: &str) -> AppResult<Self> {
        Self::parse(line.split_whitespace())
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.exec, self.to_args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_transport_a_line() {
        let mut cmd = WorkerCommand::new("hwacq-edttake", "kiwikiu").with_unit(1, 0);
        cmd.cast_to_u16 = true;
        cmd.timestamp = true;
        assert_eq!(
            cmd.render(),
            "hwacq-edttake -s kiwikiu -u 1 -c 0 -l 0 -N 4 -8 -t"
        );

        let cmd = WorkerCommand::new("camstack-simworker", "sim")
            .reusing_stream(true)
            .with_geometry(160, 128);
        assert!(cmd.render().ends_with("-R -W 160 -H 128"));
    }

    #[test]
    fn parse_inverts_render() {
        let mut cmd = WorkerCommand::new("camstack-simworker", "apapane")
            .with_unit(2, 1)
            .with_geometry(64, 32)
            .reusing_stream(true);
        cmd.unsigned = true;
        assert_eq!(WorkerCommand::parse_line(&cmd.render()).unwrap(), cmd);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(WorkerCommand::parse_line("take -s").is_err());
        assert!(WorkerCommand::parse_line("take -u 1").is_err());
        assert!(WorkerCommand::parse_line("take -s cam -x").is_err());
        assert!(WorkerCommand::parse_line("take -s cam -W wide").is_err());
        assert!(WorkerCommand::parse(Vec::<String>::new()).is_err());
    }

    #[test]
    fn parse_fills_defaults_and_switches() {
        let cmd = WorkerCommand::parse(["take", "-s", "cam", "-8", "-U", "-t"]).unwrap();
        assert_eq!(cmd.exec, "take");
        assert!(cmd.cast_to_u16 && cmd.unsigned && cmd.timestamp);
        assert!(!cmd.reuse_stream);
        assert_eq!((cmd.unit, cmd.channel, cmd.loop_count, cmd.n_buffers), (0, 0, 0, 4));
        assert_eq!(cmd.width, None);
    }
}
