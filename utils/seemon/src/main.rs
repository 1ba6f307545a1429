use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use seemon::{Bus, LogSink, Session, SessionConfig, Target};

#[derive(Parser)]
#[command(name = "seemon")]
#[command(about = "Single event effect monitor for a simulated MIMOSIS-1 chip")]
#[command(version)]
struct Args {
    /// Session config (YAML); flags override its keys
    #[arg(short, long, value_name = "FILE")]
    config: Option<Utf8PathBuf>,

    /// Register group to monitor
    #[arg(short, long)]
    target: Option<Target>,

    /// Bus backend: direct or i2c
    #[arg(long, value_parser = parse_bus)]
    bus: Option<Bus>,

    /// Chip id (0-7) used in I2C command bytes
    #[arg(long)]
    chip_id: Option<u8>,

    /// Pause between reads in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Stop after this many iterations (default: run until killed)
    #[arg(short = 'n', long)]
    iterations: Option<u64>,

    /// Fill byte for pattern targets (e.g. 0x55)
    #[arg(long, value_parser = parse_hex)]
    pattern: Option<u8>,

    /// Inject fake single-bit flips into the values read
    #[arg(long)]
    simulate_flip: bool,

    /// Per-read probability of an injected flip
    #[arg(long)]
    flip_probability: Option<f64>,

    /// Seed for reproducible flip injection
    #[arg(long)]
    seed: Option<u64>,

    /// Do not rewrite registers after a mismatch
    #[arg(long)]
    no_recover: bool,

    /// End the session at the first mismatch
    #[arg(long)]
    stop_on_mismatch: bool,

    /// List monitorable targets and exit
    #[arg(long)]
    list_targets: bool,
}

fn parse_hex(s: &str) -> Result<u8, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_bus(s: &str) -> Result<Bus, String> {
    match s {
        "direct" => Ok(Bus::Direct),
        "i2c" => Ok(Bus::I2c),
        other => Err(format!("unknown bus '{other}', expected direct or i2c")),
    }
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path.as_std_path())
                .with_context(|| format!("Failed to load session config {path}"))?,
            None => SessionConfig::default(),
        };

        if let Some(target) = self.target {
            config.target = target;
        }
        if let Some(bus) = self.bus {
            config.bus = bus;
        }
        if let Some(chip_id) = self.chip_id {
            config.chip_id = chip_id;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.interval_ms = interval_ms;
        }
        if let Some(iterations) = self.iterations {
            config.max_iterations = Some(iterations);
        }
        if let Some(pattern) = self.pattern {
            config.pattern = pattern;
        }
        if let Some(probability) = self.flip_probability {
            config.flip_probability = probability;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        config.simulate_flip |= self.simulate_flip;
        config.stop_on_mismatch |= self.stop_on_mismatch;
        if self.no_recover {
            config.recover = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn list_targets() {
    println!("Available targets:");
    for target in Target::ALL {
        let bytes = match (target.layout(), target.region()) {
            (Some(layout), _) => layout.byte_len(),
            (_, Some(region)) => region.len(),
            _ => 0,
        };
        println!("  {target:<12} {bytes} bytes");
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_targets {
        list_targets();
        return Ok(());
    }

    let config = args.session_config()?;
    let mut session = Session::new(config).context("Failed to set up session")?;
    session
        .configure()
        .context("Failed to write chip configuration")?;

    let report = session.run(&mut LogSink);

    println!("iterations:          {}", report.iterations);
    println!("mismatched:          {}", report.mismatched_iterations);
    println!("flipped bytes:       {}", report.flips);
    println!("flipped bits:        {}", report.flipped_bits);
    println!("read failures:       {}", report.read_failures);
    println!("recoveries:          {}", report.recoveries);
    println!("recovery failures:   {}", report.recovery_failures);
    if let Some((reference, observed)) = &report.last_mismatch {
        println!("last reference:      {reference}");
        println!("last observation:    {observed}");
    }
    if let Some(reason) = report.stop_reason {
        println!("stopped:             {reason:?}");
    }

    Ok(())
}
