//! Integration tests for complete runs against the simulated board.

use std::sync::Arc;
use std::time::Duration;

use tlu_daq::acquisition::{
    ChannelTelemetry, LogTelemetry, MemoryEventSink, RunController, RunHandle, RunState,
    StartOutcome, StopReason,
};
use tlu_daq::bus::mock::synth_frame;
use tlu_daq::bus::{MockI2cDevice, MockRegisterBus, MockTlu, SharedBus};
use tlu_daq::clock::MonotonicClock;
use tlu_daq::config::TluConfig;
use tlu_daq::i2c::I2cDevice;
use tlu_daq::tlu::{regs, Tlu};
use tracing::Span;

/// Simulated board with every I2C peripheral present.
fn board() -> (Tlu, MockTlu) {
    let bus = MockRegisterBus::new();
    let handle = bus.handle();
    for device in I2cDevice::ALL {
        handle.attach_i2c_device(device.address(), MockI2cDevice::new());
    }
    let tlu = Tlu::new(SharedBus::new(bus), Default::default(), &Span::none());
    tlu.init_hardware().expect("init failed");
    (tlu, handle)
}

fn config(rule: &str) -> TluConfig {
    let mut config = TluConfig::default();
    config.trigger.rule = rule.to_string();
    config
}

async fn start(controller: &RunController, sink: &MemoryEventSink) -> RunHandle {
    match controller
        .start(Box::new(sink.clone()))
        .await
        .expect("start failed")
    {
        StartOutcome::Started(run) => run,
        StartOutcome::AlreadyRunning => panic!("run should start"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_delivers_events_in_order_and_reports_totals() {
    let (tlu, handle) = board();

    let (telemetry, mut reports) = ChannelTelemetry::new(16);
    let controller = RunController::new(
        tlu,
        Arc::new(MonotonicClock::new()),
        Arc::new(telemetry),
        &Span::none(),
    );
    let compiled = config("CH1 or CH2").compile().expect("config rejected");
    assert_eq!(compiled.trigger_mask.low, 0xEEEE_EEEE);
    assert_eq!(compiled.trigger_mask.high, 0xEEEE_EEEE);
    controller.configure(compiled).expect("configure failed");
    assert_eq!(handle.register(regs::TRIGGER_PATTERN_LOW), Some(0xEEEE_EEEE));

    let sink = MemoryEventSink::new();
    let run = start(&controller, &sink).await;

    let frames: Vec<_> = (1..=3)
        .map(|n| synth_frame(0x3, 0x003, u64::from(n) * 1_000, n, [0; 6]))
        .collect();
    handle.inject_frames(&frames);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = sink.records();
    let numbers: Vec<u32> = records.iter().map(|r| r.event_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(records.iter().all(|r| r.inputs() == 0b11));
    assert_eq!(records[2].timestamp, 3_000);

    let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("no status report")
        .expect("telemetry closed");
    assert_eq!(report.post_veto_total, 3);
    assert_eq!(report.pre_veto_total, 3);

    let summary = run.stop().await.expect("stop failed");
    assert_eq!(summary.stop_reason, StopReason::External);
    assert_eq!(summary.records, 3);
    assert_eq!(summary.post_veto_total, 3);
    assert_eq!(summary.event_number_gaps, 0);
    assert!(sink.is_closed());
    assert_eq!(controller.state(), RunState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generated_triggers_stop_at_max_count() {
    let (tlu, handle) = board();
    handle.enable_trigger_generator(2);

    let controller = RunController::new(
        tlu,
        Arc::new(MonotonicClock::new()),
        Arc::new(LogTelemetry),
        &Span::none(),
    );
    let mut config = config("CH1");
    config.run.max_trigger_count = Some(50);
    config.run.status_interval = Duration::from_millis(20);
    controller
        .configure(config.compile().expect("config rejected"))
        .expect("configure failed");

    let sink = MemoryEventSink::new();
    let summary = start(&controller, &sink)
        .await
        .wait()
        .await
        .expect("run failed");

    assert_eq!(summary.stop_reason, StopReason::MaxTriggers);
    assert!(summary.post_veto_total >= 50);
    // Everything counted was read out, including the residual drain.
    assert_eq!(summary.records, summary.post_veto_total);
    assert_eq!(sink.len() as u64, summary.records);
    assert_eq!(summary.event_number_gaps, 0);
    assert_eq!(handle.fifo_len(), 0);
    assert_eq!(handle.register(regs::RUN_ACTIVE), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_controller_can_run_again_after_stop() {
    let (tlu, handle) = board();
    let controller = RunController::new(
        tlu,
        Arc::new(MonotonicClock::new()),
        Arc::new(LogTelemetry),
        &Span::none(),
    );
    let compiled = config("CH1").compile().expect("config rejected");
    controller.configure(compiled.clone()).expect("configure failed");

    let first = MemoryEventSink::new();
    let run = start(&controller, &first).await;
    handle.inject_frames(&[synth_frame(0x3, 0x001, 10, 1, [0; 6])]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    run.stop().await.expect("first stop failed");

    // The finished run consumed its configuration.
    assert!(controller
        .start(Box::new(MemoryEventSink::new()))
        .await
        .is_err());
    assert_eq!(controller.state(), RunState::Idle);
    controller.configure(compiled).expect("reconfigure failed");
    assert_eq!(controller.state(), RunState::Configuring);

    let second = MemoryEventSink::new();
    let run = start(&controller, &second).await;
    assert_eq!(handle.counters(), (0, 0));
    handle.inject_frames(&[synth_frame(0x3, 0x001, 10, 1, [0; 6])]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = run.stop().await.expect("second stop failed");

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(summary.post_veto_total, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_i2c_transactions_stay_whole_under_concurrent_access() {
    let (tlu, handle) = board();
    handle.enable_trigger_generator(1);

    let mut config = config("CH1 and not CH2");
    config.run.poll_interval = Duration::from_millis(1);
    config.run.status_interval = Duration::from_millis(5);
    let compiled = config.compile().expect("config rejected");

    let controller = RunController::new(
        tlu.clone(),
        Arc::new(MonotonicClock::new()),
        Arc::new(LogTelemetry),
        &Span::none(),
    );
    controller
        .configure(compiled.clone())
        .expect("configure failed");
    let sink = MemoryEventSink::new();
    let run = start(&controller, &sink).await;

    let mut workers = Vec::new();
    for worker in 0..3 {
        let tlu = tlu.clone();
        let compiled = compiled.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..10 {
                if worker % 2 == 0 {
                    tlu.init_hardware().map(|_| ())?;
                } else {
                    tlu.configure(&compiled)?;
                }
            }
            tlu_daq::Result::Ok(())
        }));
    }
    for worker in workers {
        worker.await.expect("worker panicked").expect("I2C access failed");
    }

    let summary = run.stop().await.expect("stop failed");
    assert!(handle.i2c_log_well_nested());
    assert_eq!(summary.misaligned_reads, 0);
    assert_eq!(summary.records, sink.len() as u64);
}
