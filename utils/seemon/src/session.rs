use log::info;

use crate::chip::Chip;
use crate::config::{Bus, SessionConfig};
use crate::i2c::{I2cTransport, SimulatedI2c};
use crate::layout::{Target, default_stores};
use crate::monitor::{
    BitFlipMonitor, CancelToken, EventSink, ImageProbe, ImageWrite, MonitorReport, Probe,
    Recovery, UpdateRegisters,
};
use crate::regmap::{PatternBuffer, RegisterStore};
use crate::register_file::SimulatedRegisterFile;
use crate::transport::{Transport, TransportError};

/// Simulated chip behind either bus backend.
pub enum SimulatedChip {
    Direct(SimulatedRegisterFile),
    I2c(I2cTransport<SimulatedI2c>),
}

impl SimulatedChip {
    pub fn new(bus: Bus, chip_id: u8, seed: Option<u64>) -> Self {
        let regs = match seed {
            Some(seed) => SimulatedRegisterFile::with_seed(seed),
            None => SimulatedRegisterFile::new(),
        };
        match bus {
            Bus::Direct => SimulatedChip::Direct(regs),
            Bus::I2c => SimulatedChip::I2c(I2cTransport::new(SimulatedI2c::new(chip_id, regs), chip_id)),
        }
    }

    pub fn regs(&self) -> &SimulatedRegisterFile {
        match self {
            SimulatedChip::Direct(regs) => regs,
            SimulatedChip::I2c(transport) => transport.bus().regs(),
        }
    }

    pub fn regs_mut(&mut self) -> &mut SimulatedRegisterFile {
        match self {
            SimulatedChip::Direct(regs) => regs,
            SimulatedChip::I2c(transport) => transport.bus_mut().regs_mut(),
        }
    }
}

impl Transport for SimulatedChip {
    fn read(&mut self, address: u16) -> Result<u8, TransportError> {
        match self {
            SimulatedChip::Direct(regs) => regs.read(address),
            SimulatedChip::I2c(transport) => transport.read(address),
        }
    }

    fn write(&mut self, address: u16, value: u8) -> Result<(), TransportError> {
        match self {
            SimulatedChip::Direct(regs) => regs.write(address, value),
            SimulatedChip::I2c(transport) => transport.write(address, value),
        }
    }
}

/// One monitoring session against a simulated chip: configuration, chip, register
/// images and the monitor that watches them.
pub struct Session {
    config: SessionConfig,
    chip: Chip<SimulatedChip>,
    gen_conf: RegisterStore,
    dac: RegisterStore,
    monitor: BitFlipMonitor,
}

impl Session {
    pub fn new(config: SessionConfig) -> crate::Result<Self> {
        config.validate()?;
        let (mut gen_conf, mut dac) = default_stores();
        config.apply_overrides(&mut gen_conf, &mut dac)?;

        let transport = SimulatedChip::new(config.bus, config.chip_id, config.seed);
        let chip = match config.seed {
            Some(seed) => Chip::with_seed(transport, seed),
            None => Chip::new(transport),
        };
        let monitor = BitFlipMonitor::new(config.monitor_config());
        Ok(Self {
            config,
            chip,
            gen_conf,
            dac,
            monitor,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn chip(&self) -> &Chip<SimulatedChip> {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut Chip<SimulatedChip> {
        &mut self.chip
    }

    pub fn gen_conf(&self) -> &RegisterStore {
        &self.gen_conf
    }

    pub fn dac(&self) -> &RegisterStore {
        &self.dac
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.monitor.cancel_token()
    }

    /// Test pattern of the target, for pattern-filled targets.
    pub fn pattern(&self) -> Option<PatternBuffer> {
        self.config
            .target
            .region()
            .map(|region| PatternBuffer::filled(region, self.config.pattern))
    }

    /// Writes GenConf, DAC and the target pattern. Returns the number of bytes written.
    pub fn configure(&mut self) -> crate::Result<usize> {
        let mut written = self.chip.write_image(&self.gen_conf)?;
        written += self.chip.write_image(&self.dac)?;
        if let Some(pattern) = self.pattern() {
            written += self.chip.write_image(&pattern)?;
        }
        info!(
            "configured chip {} over {:?} bus: {written} bytes",
            self.config.chip_id, self.config.bus
        );
        Ok(written)
    }

    /// Runs the monitor on the configured target until it stops.
    pub fn run(&mut self, sink: &mut dyn EventSink) -> MonitorReport {
        let mut probe: Box<dyn Probe<SimulatedChip>> = match self.pattern() {
            Some(pattern) => Box::new(ImageProbe::new(pattern)),
            None if self.config.target == Target::GenConf => {
                Box::new(ImageProbe::new(self.gen_conf.clone()))
            }
            None => Box::new(ImageProbe::new(self.dac.clone())),
        };

        let mut recoveries: Vec<Box<dyn Recovery<SimulatedChip>>> = Vec::new();
        if self.config.recover {
            match self.pattern() {
                Some(pattern) => recoveries.push(Box::new(ImageWrite::new(pattern))),
                None => recoveries.push(Box::new(UpdateRegisters::new(
                    self.gen_conf.clone(),
                    self.dac.clone(),
                ))),
            }
        }

        self.monitor
            .start(&mut self.chip, probe.as_mut(), &mut recoveries, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorEvent;

    fn session(yaml: &str) -> Session {
        Session::new(SessionConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn configure_writes_registers_and_pattern() {
        for bus in ["direct", "i2c"] {
            let mut session = session(&format!("bus: {bus}\ntarget: monitoring\nseed: 1"));
            assert_eq!(session.configure().unwrap(), 16 + 15 + 15);

            let regs = session.chip().transport().regs();
            assert_eq!(regs.get(0x0020), 0x40);
            assert_eq!(regs.get(0x0041), 52);
            assert!(regs.bytes()[0x00E0..0x00EF].iter().all(|&b| b == 0x55));
        }
    }

    #[test]
    fn clean_session_has_no_flips() {
        let mut session = session("interval_ms: 0\nmax_iterations: 10\nseed: 3");
        session.configure().unwrap();
        let mut events: Vec<MonitorEvent> = Vec::new();
        let report = session.run(&mut events);

        assert_eq!(report.iterations, 10);
        assert_eq!(report.flips, 0);
        assert!(matches!(events[0], MonitorEvent::Started { cells: 15, .. }));
    }

    #[test]
    fn persistent_upset_repaired_by_update_registers() {
        let mut session = session("bus: i2c\ninterval_ms: 0\nmax_iterations: 3\nseed: 3");
        session.configure().unwrap();
        session.chip_mut().transport_mut().regs_mut().upset(0x0042, 0x01);

        let mut events: Vec<MonitorEvent> = Vec::new();
        let report = session.run(&mut events);
        assert_eq!(report.mismatched_iterations, 1);
        assert_eq!(report.recoveries, 1);
        assert_eq!(session.chip().transport().regs().get(0x0042), 28);
    }

    #[test]
    fn flips_are_injected_only_by_the_chip() {
        let mut session = session(
            "target: ro-tst-conf\ninterval_ms: 0\nmax_iterations: 2\nsimulate_flip: true\nflip_probability: 1.0\nrecover: false\nseed: 4",
        );
        session.configure().unwrap();
        let report = session.run(&mut Vec::<MonitorEvent>::new());

        assert_eq!(report.flips, 40);
        assert_eq!(session.chip().injected_flips(), 40);
        let regs = session.chip().transport().regs();
        assert_eq!(regs.injector().injected(), 0);
        assert!(regs.bytes()[0x8040..0x8054].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn overrides_reach_the_chip() {
        let mut session = session("dac: {VCASN2: 90}\nseed: 0");
        session.configure().unwrap();
        assert_eq!(session.dac().get("VCASN2").unwrap(), 90);
        assert_eq!(session.chip().transport().regs().get(0x004C), 90);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let config = SessionConfig::from_yaml("dac: {NOPE: 1}").unwrap();
        assert!(matches!(
            Session::new(config),
            Err(crate::Error::Config(_))
        ));
    }
}
