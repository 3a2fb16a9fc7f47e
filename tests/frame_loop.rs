mod common;

use ash::vk;
use common::{count_calls, harness, Recording};
use mix_gfx::backend::{FailPoint, Fault, GpuCall};
use mix_gfx::{BackendError, BackendServices, BackendState, FrameContext, FrameStatus, Renderer};

/// Closes the command buffer itself on its first frame.
struct EndsItsOwnBuffer {
    armed: bool,
}

impl Renderer for EndsItsOwnBuffer {
    fn name(&self) -> &str {
        "ends-own-buffer"
    }

    fn render(&mut self, frame: &FrameContext, services: &BackendServices<'_>) -> anyhow::Result<()> {
        let gpu = services.gpu()?;
        gpu.cmd_clear_color_image(frame.command_buffer, frame.image, [1.0, 0.0, 0.0, 1.0]);
        if std::mem::take(&mut self.armed) {
            gpu.end_command_buffer(frame.command_buffer)?;
        }
        Ok(())
    }
}

fn presented_slots(h: &mut common::Harness, frames: usize) -> Vec<usize> {
    (0..frames)
        .map(|_| match h.backend.render().unwrap() {
            FrameStatus::Presented { slot, .. } => slot,
            other => panic!("expected a presented frame, got {:?}", other),
        })
        .collect()
}

#[test]
fn two_images_alternate_slots() {
    let mut h = harness();
    h.build();

    let mut slots = Vec::new();
    for _ in 0..10 {
        match h.backend.render().unwrap() {
            FrameStatus::Presented { slot, image_index, suboptimal } => {
                assert_eq!(slot as u32, image_index);
                assert!(!suboptimal);
                slots.push(slot);
            }
            other => panic!("unexpected frame status {:?}", other),
        }
    }

    assert_eq!(slots, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);
    assert_eq!(h.backend.frame_index(), 10);
    assert_eq!(h.backend.state(), BackendState::Running);
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());

    h.backend.teardown();
    h.assert_clean();
}

#[test]
fn slot_fence_is_waited_before_its_buffer_is_rerecorded() {
    let mut h = harness();
    h.build();
    let slots: Vec<_> = h.backend.swapchain().unwrap().slots().to_vec();
    h.probe.clear_calls();

    for _ in 0..6 {
        h.backend.render().unwrap();
    }

    let calls = h.probe.calls();
    for slot in &slots {
        let mut fence_waited = false;
        for call in &calls {
            match call {
                GpuCall::WaitFence(fence) if *fence == slot.in_flight => fence_waited = true,
                GpuCall::ResetCommandBuffer(cb) | GpuCall::BeginCommandBuffer(cb) if *cb == slot.command_buffer => {
                    assert!(fence_waited, "command buffer {:?} touched before its fence wait", cb);
                }
                GpuCall::Submit { fence, .. } if *fence == slot.in_flight => fence_waited = false,
                _ => {}
            }
        }
    }
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());
}

#[test]
fn frame_submission_is_tied_to_slot_semaphores() {
    let mut h = harness();
    h.build();
    let slot = h.backend.swapchain().unwrap().slots()[0];
    h.probe.clear_calls();

    h.backend.render().unwrap();

    let submit = h
        .probe
        .calls()
        .into_iter()
        .find(|call| matches!(call, GpuCall::Submit { .. }))
        .unwrap();
    assert_eq!(
        submit,
        GpuCall::Submit {
            command_buffers: vec![slot.command_buffer],
            wait: vec![slot.image_available],
            signal: vec![slot.render_finished],
            fence: slot.in_flight,
        }
    );
}

#[test]
fn update_delegates_to_active_renderer_for_current_slot() {
    let mut h = harness();
    h.build();
    let (renderer, journal) = Recording::new("recording");
    let handle = h.backend.add_renderer(Box::new(renderer)).unwrap();

    // Not active yet: update and render touch no renderer
    assert_eq!(h.backend.update().unwrap(), FrameStatus::Ready { slot: 0 });
    h.backend.render().unwrap();
    assert!(journal.lock().updates.is_empty());

    h.backend.set_active_renderer(Some(handle)).unwrap();
    for _ in 0..3 {
        h.backend.update().unwrap();
        h.backend.render().unwrap();
    }

    let journal = journal.lock();
    assert_eq!(journal.updates, vec![1, 0, 1]);
    assert_eq!(journal.frames, vec![(1, 1), (0, 0), (1, 1)]);
}

#[test]
fn active_renderer_records_instead_of_clear_pass() {
    let mut h = harness();
    h.build();
    let (renderer, _journal) = Recording::new("green");
    let handle = h.backend.add_renderer(Box::new(renderer)).unwrap();
    h.backend.set_active_renderer(Some(handle)).unwrap();
    h.probe.clear_calls();

    h.backend.render().unwrap();

    let clears: Vec<[f32; 4]> = h
        .probe
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GpuCall::ClearColorImage { color, .. } => Some(color),
            _ => None,
        })
        .collect();
    assert_eq!(clears, vec![[0.0, 1.0, 0.0, 1.0]]);
}

#[test]
fn failing_renderer_still_presents_a_clear_frame() {
    let mut h = harness();
    h.build();
    let (mut renderer, journal) = Recording::new("broken");
    renderer.fail_render = true;
    let handle = h.backend.add_renderer(Box::new(renderer)).unwrap();
    h.backend.set_active_renderer(Some(handle)).unwrap();
    h.probe.clear_calls();

    let err = h.backend.render().unwrap_err();
    assert!(matches!(err, BackendError::Renderer { ref name, .. } if name == "broken"));
    assert_eq!(count_calls(&h.probe.calls(), |c| matches!(c, GpuCall::Present { .. })), 1);

    // The timeline stays consistent, so later frames keep working
    assert!(h.backend.render().is_err());
    assert_eq!(journal.lock().frames.len(), 2);
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());
}

#[test]
fn removing_the_active_renderer_is_rejected() {
    let mut h = harness();
    h.build();
    let (renderer, journal) = Recording::new("active");
    let handle = h.backend.add_renderer(Box::new(renderer)).unwrap();
    h.backend.set_active_renderer(Some(handle)).unwrap();

    assert!(matches!(
        h.backend.remove_renderer(handle),
        Err(BackendError::ActiveRenderer(h2)) if h2 == handle
    ));
    assert_eq!(h.backend.registry().len(), 1);
    assert_eq!(h.backend.active_renderer(), Some(handle));
    assert_eq!(journal.lock().detached, 0);

    h.backend.set_active_renderer(None).unwrap();
    let removed = h.backend.remove_renderer(handle).unwrap();
    assert_eq!(removed.name(), "active");
    assert_eq!(journal.lock().detached, 1);
    assert!(matches!(h.backend.renderer(handle), Err(BackendError::InvalidHandle(_))));

    let next = h.backend.add_renderer(Box::new(Recording::new("next").0)).unwrap();
    assert_ne!(next, handle);
}

#[test]
fn out_of_date_present_recovers_after_rebuild() {
    let mut h = harness();
    h.build();
    h.backend.render().unwrap();

    h.probe.inject(Fault::PresentOutOfDate);
    assert_eq!(h.backend.render().unwrap(), FrameStatus::OutOfDate);

    h.target.resize(800, 600);
    assert!(h.backend.rebuild_swapchain().unwrap());
    let swapchain = h.backend.swapchain().unwrap();
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(swapchain.current_slot(), 0);

    assert!(matches!(h.backend.render().unwrap(), FrameStatus::Presented { slot: 0, .. }));
    assert!(matches!(h.backend.render().unwrap(), FrameStatus::Presented { slot: 1, .. }));
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());

    h.backend.teardown();
    h.assert_clean();
}

#[test]
fn out_of_date_acquire_leaves_the_fence_signaled() {
    let mut h = harness();
    h.build();

    h.probe.inject(Fault::AcquireOutOfDate);
    assert_eq!(h.backend.render().unwrap(), FrameStatus::OutOfDate);

    // No rebuild: the slot fence was never reset, so the next frame does not stall
    assert!(matches!(h.backend.render().unwrap(), FrameStatus::Presented { slot: 0, .. }));
}

#[test]
fn suboptimal_is_reported_not_fatal() {
    let mut h = harness();
    h.build();
    h.probe.inject(Fault::AcquireSuboptimal);
    assert!(matches!(
        h.backend.render().unwrap(),
        FrameStatus::Presented { suboptimal: true, .. }
    ));
    h.probe.inject(Fault::PresentSuboptimal);
    assert!(matches!(
        h.backend.render().unwrap(),
        FrameStatus::Presented { suboptimal: true, .. }
    ));
}

#[test]
fn fence_timeout_surfaces_as_timeout() {
    let mut h = harness();
    h.build();

    h.probe.inject(Fault::FenceTimeout);
    assert_eq!(h.backend.render().unwrap(), FrameStatus::Timeout);
    h.probe.inject(Fault::FenceTimeout);
    assert_eq!(h.backend.update().unwrap(), FrameStatus::Timeout);

    h.probe.inject(Fault::AcquireTimeout);
    assert_eq!(h.backend.render().unwrap(), FrameStatus::Timeout);

    // Nothing was touched, so frames resume on slot 0
    assert!(matches!(h.backend.render().unwrap(), FrameStatus::Presented { slot: 0, .. }));
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());
}

#[test]
fn device_loss_latches() {
    let mut h = harness();
    h.build();
    h.backend.render().unwrap();

    h.probe.inject(Fault::DeviceLost);
    assert!(matches!(h.backend.render(), Err(BackendError::DeviceLost)));
    assert!(h.backend.is_device_lost());

    h.probe.clear_calls();
    assert!(matches!(h.backend.render(), Err(BackendError::DeviceLost)));
    assert!(matches!(h.backend.update(), Err(BackendError::DeviceLost)));
    assert!(matches!(h.backend.rebuild_swapchain(), Err(BackendError::DeviceLost)));
    // Fails fast without reaching the device
    assert!(h.probe.calls().is_empty());

    h.backend.teardown();
    assert_eq!(h.probe.live_objects(), 0);
}

#[test]
fn minimized_target_defers_rebuild_and_skips_frames() {
    let mut h = harness();
    h.build();

    h.target.resize(0, 0);
    assert!(!h.backend.rebuild_swapchain().unwrap());
    assert!(h.backend.is_rebuild_pending());
    assert_eq!(h.backend.render().unwrap(), FrameStatus::Skipped);
    assert_eq!(h.backend.update().unwrap(), FrameStatus::Skipped);

    h.target.resize(1024, 768);
    assert!(matches!(h.backend.render().unwrap(), FrameStatus::Presented { slot: 0, .. }));
    assert!(!h.backend.is_rebuild_pending());
    assert_eq!(
        h.backend.swapchain().unwrap().extent(),
        vk::Extent2D { width: 1024, height: 768 }
    );
}

#[test]
fn swapchain_settings_change_rebuilds_with_new_mode_and_count() {
    let mut h = harness();
    h.build();
    h.backend.render().unwrap();

    let mut settings = h.backend.swapchain().unwrap().settings().clone();
    settings.present_modes = vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
    settings.image_count = 3;
    assert!(h.backend.update_swapchain_settings(settings).unwrap());

    let swapchain = h.backend.swapchain().unwrap();
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
    assert_eq!(swapchain.slot_count(), 3);

    let slots: Vec<usize> = (0..4)
        .map(|_| match h.backend.render().unwrap() {
            FrameStatus::Presented { slot, .. } => slot,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(slots, vec![0, 1, 2, 0]);
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());
}

#[test]
fn unsupported_present_mode_falls_back_to_fifo() {
    let mut h = harness();
    let mut config = h.config();
    config.present_modes = vec![vk::PresentModeKHR::IMMEDIATE];
    h.backend.build(config).unwrap();
    assert_eq!(h.backend.swapchain().unwrap().present_mode(), vk::PresentModeKHR::FIFO);
}

#[test]
fn param_block_flush_reaches_the_gpu_copy() {
    let mut h = harness();
    h.build();

    let mut block = h
        .backend
        .create_param_block(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
        .unwrap();
    block.write_value(0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    assert!(block.is_dirty());
    assert_eq!(block.read_value::<[f32; 4]>(0).unwrap(), [1.0, 2.0, 3.0, 4.0]);

    let raw = h
        .backend
        .allocator()
        .unwrap()
        .raw_buffer(block.buffer().unwrap())
        .unwrap();
    assert_eq!(h.probe.buffer_contents(raw.buffer).unwrap(), vec![0u8; 16]);

    h.backend.flush_param_block(&mut block).unwrap();
    assert!(!block.is_dirty());
    assert_eq!(
        h.probe.buffer_contents(raw.buffer).unwrap(),
        bytemuck::bytes_of(&[1.0f32, 2.0, 3.0, 4.0]).to_vec()
    );

    h.backend.release_param_block(&mut block).unwrap();
    assert!(block.buffer().is_none());
    assert_eq!(h.backend.allocator().unwrap().live_buffers(), 0);
    // The cache outlives the GPU copy
    assert_eq!(block.read_value::<f32>(4).unwrap(), 2.0);

    h.backend.teardown();
    h.assert_clean();
}

#[test]
fn deactivating_the_renderer_falls_back_to_clear_color() {
    let mut h = harness();
    h.build();
    let (renderer, journal) = Recording::new("short-lived");
    let handle = h.backend.add_renderer(Box::new(renderer)).unwrap();
    h.backend.set_active_renderer(Some(handle)).unwrap();
    h.backend.render().unwrap();

    h.backend.set_active_renderer(None).unwrap();
    h.backend.set_clear_color([0.25, 0.5, 0.75, 1.0]);
    h.probe.clear_calls();
    h.backend.render().unwrap();

    assert_eq!(journal.lock().frames.len(), 1);
    assert!(h.probe.calls().contains(&GpuCall::ClearColorImage {
        buffer: h.backend.swapchain().unwrap().slots()[1].command_buffer,
        image: h.backend.swapchain().unwrap().image(1).unwrap(),
        color: [0.25, 0.5, 0.75, 1.0],
    }));
}

#[test]
fn failed_recording_releases_the_slot() {
    let mut h = harness();
    h.build();
    let handle = h
        .backend
        .add_renderer(Box::new(EndsItsOwnBuffer { armed: true }))
        .unwrap();
    h.backend.set_active_renderer(Some(handle)).unwrap();

    let err = h.backend.render().unwrap_err();
    assert!(matches!(err, BackendError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT)));
    assert_eq!(count_calls(&h.probe.calls(), |c| matches!(c, GpuCall::Present { .. })), 1);
    assert_eq!(h.backend.state(), BackendState::Built);

    assert_eq!(presented_slots(&mut h, 4), vec![1, 0, 1, 0]);
    // Only the renderer's own misuse is flagged
    assert_eq!(h.probe.violations().len(), 1, "{:?}", h.probe.violations());

    h.backend.teardown();
    assert_eq!(h.probe.live_objects(), 0);
}

#[test]
fn failed_submission_releases_the_slot() {
    let mut h = harness();
    h.build();
    h.backend.render().unwrap();

    h.probe.inject(Fault::SubmitOutOfMemory);
    let err = h.backend.render().unwrap_err();
    assert!(matches!(err, BackendError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)));

    assert_eq!(presented_slots(&mut h, 3), vec![0, 1, 0]);
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());

    h.backend.teardown();
    h.assert_clean();
}

#[test]
fn failed_rebuild_reports_out_of_date_until_recovered() {
    let mut h = harness();
    h.build();
    h.backend.render().unwrap();

    h.probe.fail_next(FailPoint::CreateSwapchain);
    assert!(h.backend.rebuild_swapchain().is_err());
    assert!(h.backend.swapchain().unwrap().is_retired());
    assert_eq!(h.backend.render().unwrap(), FrameStatus::OutOfDate);
    assert_eq!(h.backend.update().unwrap(), FrameStatus::OutOfDate);

    assert!(h.backend.rebuild_swapchain().unwrap());
    assert!(!h.backend.swapchain().unwrap().is_retired());
    assert_eq!(presented_slots(&mut h, 2), vec![0, 1]);
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());

    h.backend.teardown();
    h.assert_clean();
}

#[test]
fn command_buffer_shortage_after_rebuild_retries_next_frame() {
    let mut h = harness();
    h.build();
    h.backend.render().unwrap();

    h.probe.fail_next(FailPoint::AllocateCommandBuffers);
    assert!(h.backend.rebuild_swapchain().is_err());
    assert!(h.backend.is_rebuild_pending());

    assert_eq!(presented_slots(&mut h, 2), vec![0, 1]);
    assert!(!h.backend.is_rebuild_pending());
    assert!(h
        .backend
        .swapchain()
        .unwrap()
        .slots()
        .iter()
        .all(|slot| slot.command_buffer != vk::CommandBuffer::null()));
    assert!(h.probe.violations().is_empty(), "{:?}", h.probe.violations());

    h.backend.teardown();
    h.assert_clean();
}
