#![allow(dead_code)]

use ash::vk;
use mix_gfx::backend::{GpuCall, HeadlessConfig, HeadlessPlatform, HeadlessProbe, HeadlessTarget};
use mix_gfx::{BackendConfig, BackendServices, ContractMode, FrameContext, GraphicsBackend, Renderer};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Harness {
    pub backend: GraphicsBackend,
    pub probe: Arc<HeadlessProbe>,
    pub target: Arc<HeadlessTarget>,
}

pub fn harness() -> Harness {
    harness_with(HeadlessConfig::default())
}

pub fn harness_with(platform_config: HeadlessConfig) -> Harness {
    let platform = HeadlessPlatform::new(platform_config);
    let probe = platform.probe();
    Harness {
        backend: GraphicsBackend::new(Box::new(platform)),
        probe,
        target: Arc::new(HeadlessTarget::new(640, 480)),
    }
}

impl Harness {
    pub fn config(&self) -> BackendConfig {
        let mut config = BackendConfig::new(self.target.clone());
        config.validation = false;
        config.image_count = 2;
        config.present_modes = vec![vk::PresentModeKHR::FIFO];
        config.contract_mode = ContractMode::Report;
        config
    }

    pub fn build(&mut self) {
        let config = self.config();
        self.backend.build(config).expect("headless build");
    }

    pub fn assert_clean(&self) {
        assert_eq!(self.probe.live_objects(), 0, "live objects remain");
        assert!(self.probe.violations().is_empty(), "{:?}", self.probe.violations());
    }
}

/// What a test renderer saw, shared with the test body.
#[derive(Debug, Default)]
pub struct Journal {
    pub attached: usize,
    pub detached: usize,
    pub updates: Vec<usize>,
    pub frames: Vec<(usize, u32)>,
}

pub struct Recording {
    pub name: &'static str,
    pub journal: Arc<Mutex<Journal>>,
    pub fail_render: bool,
}

impl Recording {
    pub fn new(name: &'static str) -> (Self, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        (
            Self {
                name,
                journal: journal.clone(),
                fail_render: false,
            },
            journal,
        )
    }
}

impl Renderer for Recording {
    fn name(&self) -> &str {
        self.name
    }

    fn attach(&mut self, _services: &BackendServices<'_>) -> anyhow::Result<()> {
        self.journal.lock().attached += 1;
        Ok(())
    }

    fn update(&mut self, slot: usize, _services: &BackendServices<'_>) -> anyhow::Result<()> {
        self.journal.lock().updates.push(slot);
        Ok(())
    }

    fn render(&mut self, frame: &FrameContext, services: &BackendServices<'_>) -> anyhow::Result<()> {
        self.journal.lock().frames.push((frame.slot, frame.image_index));
        if self.fail_render {
            anyhow::bail!("shader exploded");
        }
        services
            .gpu()?
            .cmd_clear_color_image(frame.command_buffer, frame.image, [0.0, 1.0, 0.0, 1.0]);
        Ok(())
    }

    fn detach(&mut self, _services: &BackendServices<'_>) -> anyhow::Result<()> {
        self.journal.lock().detached += 1;
        Ok(())
    }
}

pub fn count_calls(calls: &[GpuCall], matches: impl Fn(&GpuCall) -> bool) -> usize {
    calls.iter().filter(|call| matches(call)).count()
}
