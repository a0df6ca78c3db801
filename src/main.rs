//! Command-line frame grabber: acquire one burst of frames and report it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use framegrab::{info, AcquireStatus, CaptureDevice, CaptureParams, PixelFormat};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "framegrab", version)]
#[command(about = "Acquire raw frames from a V4L2 capture device")]
struct Cli {
    /// Video device node
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Acquisition pixel format
    #[arg(short, long, value_enum, default_value_t = FormatArg::Rgb32)]
    format: FormatArg,

    /// Number of frames to acquire
    #[arg(short, long, default_value_t = 5)]
    count: i32,

    /// Horizontal resolution
    #[arg(short, long, default_value_t = 1024)]
    width: u32,

    /// Vertical resolution
    #[arg(long, default_value_t = 768)]
    height: u32,

    /// Print device capabilities and exit
    #[arg(long)]
    probe: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    /// 8-bit greyscale
    Grey,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// UYVY 4:2:2 packed
    Uyvy,
    /// 32-bit RGB
    Rgb32,
    /// Motion JPEG
    Mjpeg,
}

impl From<FormatArg> for PixelFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Grey => Self::Greyscale,
            FormatArg::Yuyv => Self::Yuyv,
            FormatArg::Uyvy => Self::Uyvy,
            FormatArg::Rgb32 => Self::Rgb32,
            FormatArg::Mjpeg => Self::Mjpeg,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> framegrab::Result<ExitCode> {
    if cli.probe {
        let report = info::probe(&cli.device)?;
        println!("{report}");
        return Ok(ExitCode::SUCCESS);
    }

    let params = CaptureParams::new(&cli.device)
        .with_frame_count(cli.count)
        .with_format(cli.format.into())
        .with_resolution(cli.width, cli.height);

    let mut device = CaptureDevice::open(&params)?;
    let status = device.acquire()?;

    let mut code = ExitCode::SUCCESS;
    if let AcquireStatus::Corrupted(slots) = &status {
        eprintln!("Frame data may be corrupted in slots {slots:?}");
        code = ExitCode::FAILURE;
    }

    let format = device.format();
    for (index, frame) in device.frames().iter().enumerate() {
        println!(
            "Frame {index}: {}x{} {} bytes",
            format.width,
            format.height,
            frame.len()
        );
    }
    Ok(code)
}
