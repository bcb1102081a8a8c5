use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use camera_appsrc::{
    demand_callback, AcquisitionBridge, AcquisitionMode, BridgeConfig, BridgeState,
    ChannelHandoff, Delivery, FrameHandoff, FrameSource, GrabStatus, HandoffEvent, OutputEncoding,
    OwnedFrame, PixelEncoding, PublishedFrame, PullDriver, PullEnd, RetrieveError, Rotation,
    StopError, SyntheticConfig, SyntheticControl, SyntheticSource,
};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 2;

fn quick_config() -> BridgeConfig {
    BridgeConfig {
        retrieve_timeout: Duration::from_millis(50),
        ..BridgeConfig::default()
    }
}

fn bridge_with(
    encoding: PixelEncoding,
    config: &BridgeConfig,
) -> Result<(
    AcquisitionBridge<SyntheticSource>,
    SyntheticControl,
    Receiver<HandoffEvent>,
)> {
    let source = SyntheticSource::new(SyntheticConfig::manual(encoding, WIDTH, HEIGHT));
    let control = source.control();
    let (handoff, events) = ChannelHandoff::new();
    let mut bridge = AcquisitionBridge::new(source, handoff);
    bridge.initialize(config)?;
    Ok((bridge, control, events))
}

fn frames(events: &Receiver<HandoffEvent>) -> Vec<HandoffEvent> {
    events.try_iter().collect()
}

fn frame_bytes(event: &HandoffEvent) -> &[u8] {
    match event {
        HandoffEvent::Frame(frame) => &frame.data,
        HandoffEvent::EndOfStream => panic!("expected a frame, got end of stream"),
    }
}

#[test]
fn close_is_idempotent_from_every_state() -> Result<()> {
    let source = SyntheticSource::new(SyntheticConfig::manual(PixelEncoding::Mono8, WIDTH, HEIGHT));
    let (handoff, _events) = ChannelHandoff::new();
    let mut fresh = AcquisitionBridge::new(source, handoff);
    fresh.close()?;
    fresh.close()?;
    assert_eq!(fresh.state(), BridgeState::Closed);

    let (mut bridge, control, events) = bridge_with(PixelEncoding::Mono8, &quick_config())?;
    bridge.start()?;
    bridge.close()?;
    bridge.close()?;
    assert_eq!(bridge.state(), BridgeState::Closed);
    assert!(!control.is_grabbing());
    assert!(!bridge.source().is_open());

    let tail = frames(&events);
    assert_eq!(tail, vec![HandoffEvent::EndOfStream]);
    assert!(matches!(
        bridge.retrieve_and_publish(),
        Err(RetrieveError::InvalidState(BridgeState::Closed))
    ));
    Ok(())
}

#[test]
fn retrieve_before_start_fails_without_touching_buffer() -> Result<()> {
    let (mut bridge, _control, events) = bridge_with(PixelEncoding::Mono8, &quick_config())?;

    assert!(matches!(
        bridge.retrieve_and_publish(),
        Err(RetrieveError::InvalidState(BridgeState::Initialized))
    ));
    let buffer = bridge.buffer().expect("buffer allocated at initialize");
    assert!(buffer.is_placeholder());
    assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    assert!(frames(&events).is_empty());
    assert_eq!(bridge.stats().published, 0);
    Ok(())
}

#[test]
fn only_the_latest_image_is_published() -> Result<()> {
    let (mut bridge, control, events) = bridge_with(PixelEncoding::Mono8, &quick_config())?;
    bridge.start()?;

    control.push_pixels(vec![1; 8]);
    control.push_pixels(vec![2; 8]);
    let newest = control.push_pixels(vec![3; 8]);

    assert_eq!(
        bridge.retrieve_and_publish()?,
        Delivery::Published {
            fresh: true,
            end_of_stream: false
        }
    );
    let published = frames(&events);
    assert_eq!(published.len(), 1);
    match &published[0] {
        HandoffEvent::Frame(frame) => {
            assert_eq!(frame.sequence, newest);
            assert_eq!(frame.data, vec![3; 8]);
        }
        HandoffEvent::EndOfStream => panic!("expected frame"),
    }
    assert_eq!(control.discarded(), 2);
    Ok(())
}

#[test]
fn failed_grab_republishes_previous_bytes_once() -> Result<()> {
    let (mut bridge, control, events) = bridge_with(PixelEncoding::Mono8, &quick_config())?;
    bridge.start()?;

    control.push_pixels(vec![7, 6, 5, 4, 3, 2, 1, 0]);
    bridge.retrieve_and_publish()?;

    control.fail_next_grabs(1);
    control.push_pixels(vec![9; 8]);
    assert_eq!(
        bridge.retrieve_and_publish()?,
        Delivery::Published {
            fresh: false,
            end_of_stream: false
        }
    );

    let published = frames(&events);
    assert_eq!(published.len(), 2);
    assert_eq!(frame_bytes(&published[0]), frame_bytes(&published[1]));

    let stats = bridge.stats();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.stale, 1);
    assert_eq!(stats.transient_failures, 1);

    // The frame queued behind the failure is still the newest one.
    bridge.retrieve_and_publish()?;
    let published = frames(&events);
    assert_eq!(published.len(), 1);
    assert_eq!(frame_bytes(&published[0]), &[9; 8][..]);
    Ok(())
}

#[test]
fn malformed_frame_is_treated_as_transient() -> Result<()> {
    let (mut bridge, control, events) = bridge_with(PixelEncoding::Mono8, &quick_config())?;
    bridge.start()?;

    control.push_pixels(vec![5; 8]);
    bridge.retrieve_and_publish()?;
    control.push_pixels(vec![6; 3]);
    assert_eq!(
        bridge.retrieve_and_publish()?,
        Delivery::Published {
            fresh: false,
            end_of_stream: false
        }
    );

    let stale = Delivery::Published {
        fresh: false,
        end_of_stream: false,
    };
    let wrong_size = OwnedFrame::succeeded(PixelEncoding::Mono8, WIDTH * 2, HEIGHT, 90, vec![1; 16]);
    assert!(control.push_frame(wrong_size));
    assert_eq!(bridge.retrieve_and_publish()?, stale);

    let flagged = OwnedFrame {
        status: GrabStatus::Failed {
            code: 0x0e00_0001,
            description: "buffer incompletely grabbed".to_string(),
        },
        ..OwnedFrame::succeeded(PixelEncoding::Mono8, WIDTH, HEIGHT, 91, vec![2; 8])
    };
    assert!(control.push_frame(flagged));
    assert_eq!(bridge.retrieve_and_publish()?, stale);

    let published = frames(&events);
    assert_eq!(published.len(), 4);
    for event in &published[1..] {
        assert_eq!(frame_bytes(event), &[5; 8][..]);
    }
    assert_eq!(bridge.stats().transient_failures, 3);
    Ok(())
}

#[test]
fn hardware_trigger_mode_waits_for_the_trigger_line() -> Result<()> {
    let config = BridgeConfig {
        hardware_trigger: true,
        ..quick_config()
    };
    let (mut bridge, control, events) = bridge_with(PixelEncoding::Mono8, &config)?;
    assert_eq!(
        bridge.capture_format().map(|format| format.mode),
        Some(AcquisitionMode::HardwareTrigger)
    );
    bridge.start()?;

    // No pulse yet: the placeholder goes out again.
    assert_eq!(
        bridge.retrieve_and_publish()?,
        Delivery::Published {
            fresh: false,
            end_of_stream: false
        }
    );

    let fired = control.fire_hardware_trigger();
    assert!(fired.is_some());
    assert_eq!(fired, Some(control.last_sequence()));
    assert_eq!(
        bridge.retrieve_and_publish()?,
        Delivery::Published {
            fresh: true,
            end_of_stream: false
        }
    );
    assert_eq!(control.trigger_count(), 0);

    let published = frames(&events);
    assert_eq!(published.len(), 2);
    match &published[1] {
        HandoffEvent::Frame(frame) => assert_eq!(frame.sequence, fired),
        HandoffEvent::EndOfStream => panic!("expected the triggered frame"),
    }
    Ok(())
}

#[test]
fn buffer_length_follows_output_encoding() -> Result<()> {
    let (mono, _c1, _e1) = bridge_with(PixelEncoding::Mono12, &quick_config())?;
    assert_eq!(mono.output_encoding(), Some(OutputEncoding::Gray8));
    assert!(!mono.is_color());
    assert_eq!(mono.buffer().map(|b| b.len()), Some((WIDTH * HEIGHT) as usize));

    let (color, _c2, _e2) = bridge_with(PixelEncoding::Yuyv, &quick_config())?;
    assert_eq!(color.output_encoding(), Some(OutputEncoding::Rgb24));
    assert!(color.is_color());
    assert_eq!(
        color.buffer().map(|b| b.len()),
        Some((WIDTH * HEIGHT * 3) as usize)
    );
    Ok(())
}

#[test]
fn conversion_is_deterministic_across_bridges() -> Result<()> {
    let input: Vec<u8> = (0..(WIDTH * HEIGHT) as u8).map(|v| v * 29).collect();
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let (mut bridge, control, events) = bridge_with(PixelEncoding::BayerRg8, &quick_config())?;
        bridge.start()?;
        control.push_pixels(input.clone());
        bridge.retrieve_and_publish()?;
        assert_eq!(bridge.stats().conversions, 1);
        let published = frames(&events);
        outputs.push(frame_bytes(&published[0]).to_vec());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].len(), (WIDTH * HEIGHT * 3) as usize);
    Ok(())
}

#[test]
fn unusable_post_processing_is_disabled() -> Result<()> {
    let config = BridgeConfig {
        rescale_width: Some(1),
        rescale_height: Some(240),
        rotation: Some(45),
        ..quick_config()
    };
    let (bridge, _control, _events) = bridge_with(PixelEncoding::Rgb8, &config)?;
    let post = bridge.post_process();
    assert_eq!(post.rescale, None);
    assert_eq!(post.rotation, Rotation::None);
    assert_eq!(bridge.state(), BridgeState::Initialized);
    Ok(())
}

/// Records whether the grab engine was still running when end-of-stream arrived.
struct EngineWatch {
    control: SyntheticControl,
    grabbing_at_eos: Arc<Mutex<Vec<bool>>>,
}

impl FrameHandoff for EngineWatch {
    fn publish(&mut self, _frame: PublishedFrame<'_>) {}

    fn end_of_stream(&mut self) {
        self.grabbing_at_eos
            .lock()
            .unwrap()
            .push(self.control.is_grabbing());
    }
}

#[test]
fn stop_signals_end_of_stream_before_engine_halts() -> Result<()> {
    let source = SyntheticSource::new(SyntheticConfig::manual(PixelEncoding::Mono8, WIDTH, HEIGHT));
    let control = source.control();
    let grabbing_at_eos = Arc::new(Mutex::new(Vec::new()));
    let watch = EngineWatch {
        control: control.clone(),
        grabbing_at_eos: grabbing_at_eos.clone(),
    };
    let mut bridge = AcquisitionBridge::new(source, watch);
    bridge.initialize(&quick_config())?;

    assert!(matches!(
        bridge.stop(),
        Err(StopError::InvalidState(BridgeState::Initialized))
    ));

    bridge.start()?;
    bridge.stop()?;
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(!control.is_grabbing());
    assert_eq!(*grabbing_at_eos.lock().unwrap(), vec![true]);

    // A second stop is a no-op and sends no second end-of-stream.
    bridge.stop()?;
    assert_eq!(grabbing_at_eos.lock().unwrap().len(), 1);
    Ok(())
}

#[test]
fn concurrent_stop_never_races_retrieval() -> Result<()> {
    let source = SyntheticSource::new(SyntheticConfig {
        max_width: WIDTH,
        max_height: HEIGHT,
        max_frame_rate: 500.0,
        encoding: PixelEncoding::Mono8,
        ..SyntheticConfig::default()
    });
    let control = source.control();
    let (handoff, events) = ChannelHandoff::new();
    let mut bridge = AcquisitionBridge::new(source, handoff);
    bridge.initialize(&quick_config())?;
    bridge.start()?;
    let shared = bridge.shared();

    let demand = demand_callback(shared.clone());
    let consumer = std::thread::spawn(move || PullDriver::new().paced(100.0).run(demand));

    std::thread::sleep(Duration::from_millis(50));
    shared.lock().unwrap().stop()?;
    let summary = consumer.join().expect("consumer thread");

    assert_eq!(summary.end, PullEnd::Refused);
    assert!(!control.is_grabbing());
    let state = shared.lock().unwrap().state();
    assert_eq!(state, BridgeState::Stopped);

    let all = frames(&events);
    assert_eq!(all.last(), Some(&HandoffEvent::EndOfStream));
    assert_eq!(
        all.iter()
            .filter(|event| **event == HandoffEvent::EndOfStream)
            .count(),
        1
    );
    assert_eq!(all.len() as u64 - 1, shared.lock().unwrap().stats().published);
    Ok(())
}

#[test]
fn device_removal_ends_stream_without_publishing() -> Result<()> {
    let (mut bridge, control, events) = bridge_with(PixelEncoding::Mono8, &quick_config())?;
    bridge.start()?;
    control.push_generated();
    bridge.retrieve_and_publish()?;

    control.unplug();
    assert!(!control.is_present());
    assert_eq!(bridge.retrieve_and_publish()?, Delivery::DeviceRemoved);
    assert_eq!(bridge.state(), BridgeState::Stopped);

    let all = frames(&events);
    assert_eq!(all.len(), 2);
    assert_eq!(all[1], HandoffEvent::EndOfStream);
    assert_eq!(bridge.stats().published, 1);

    assert!(matches!(
        bridge.retrieve_and_publish(),
        Err(RetrieveError::InvalidState(BridgeState::Stopped))
    ));

    // The engine is still marked as grabbing; stop halts it quietly.
    assert!(control.is_grabbing());
    bridge.stop()?;
    assert!(!control.is_grabbing());
    assert!(frames(&events).is_empty());
    Ok(())
}

#[test]
fn frame_limit_ends_stream_after_last_publish() -> Result<()> {
    let config = BridgeConfig {
        on_demand: true,
        frame_limit: Some(3),
        ..quick_config()
    };
    let (bridge, control, events) = bridge_with(PixelEncoding::Rgb8, &config)?;
    let shared = bridge.shared();
    shared.lock().unwrap().start()?;

    let summary = PullDriver::new().run(demand_callback(shared.clone()));
    assert_eq!(summary.end, PullEnd::EndOfStream);
    assert_eq!(summary.demands, 3);
    assert_eq!(summary.fresh, 3);
    assert_eq!(control.trigger_count(), 3);

    let all = frames(&events);
    assert_eq!(all.len(), 4);
    assert_eq!(all[3], HandoffEvent::EndOfStream);

    let mut bridge = shared.lock().unwrap();
    assert_eq!(bridge.state(), BridgeState::Stopped);
    bridge.close()?;
    assert!(!control.is_grabbing());
    Ok(())
}
