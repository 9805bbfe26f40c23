use std::{
    thread,
    time::{Duration, Instant},
};

use pvcache::{
    CacheError, ErrorCondition, PvCache, PvSnapshot, Subscription, ValueBlock, WriteKind,
    WriteOptions,
    condition::ERROR_OFFSET,
    dbr::{DbrValue, Status},
    protocol::{LoopbackClient, loopback::PutBehaviour},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// Start a cache on a loopback client, with a short connect idle for quick tests
fn start_cache(client: &LoopbackClient, polling: bool) -> PvCache {
    init_logging();
    PvCache::builder()
        .polling(polling)
        .connect_idle(Duration::from_millis(10))
        .default_timeout(Duration::from_secs(2))
        .start(client.clone())
        .unwrap()
}

/// Wait for something delivered on a callback thread
fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn error_code(condition: ErrorCondition) -> u32 {
    ERROR_OFFSET + condition.code()
}

const SECOND: Duration = Duration::from_secs(1);

#[test]
fn test_register_is_idempotent() {
    let client = LoopbackClient::new();
    let cache = start_cache(&client, false);
    let first = cache.register("X").unwrap();
    let second = cache.register("X").unwrap();
    assert_eq!(first, second);
    assert_eq!(cache.info().unwrap().pvs.len(), 1);
    assert_eq!(cache.register("  X  ").unwrap(), first);
}

#[test]
fn test_read_value() {
    let client = LoopbackClient::new();
    client.add_pv("TEST:VALUE", 42i32).unwrap();
    let cache = start_cache(&client, false);

    let result = cache.read(&["TEST:VALUE"], SECOND).unwrap();
    assert!(result.ok());
    assert_eq!(result.max_element_count, 1);
    let snapshot = result.get("TEST:VALUE").unwrap();
    assert!(snapshot.has_value);
    assert_eq!(snapshot.values, vec![42.0]);
    assert_eq!(snapshot.strings, vec!["42"]);
    assert_eq!(snapshot.status_text, "NO_ALARM");
    assert_eq!(snapshot.severity_text, "NO_ALARM");
    assert_eq!(snapshot.error.code, 0);
    assert_ne!(snapshot.timestamp_text, "unknown");
    assert!(snapshot.timestamp_epoch > 0);
    assert_eq!(result.first_values(), vec![(42.0, "42".to_string())]);
}

#[test]
fn test_unknown_pv_times_out() {
    let client = LoopbackClient::new();
    let cache = start_cache(&client, false);

    let start = Instant::now();
    let result = cache
        .read(&["UNKNOWN:PV"], Duration::from_millis(200))
        .unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");

    assert!(!result.ok());
    let snapshot = &result.snapshots[0];
    assert!(!snapshot.has_value);
    assert!(snapshot.values.is_empty());
    assert_eq!(snapshot.status_text, "INVALID");
    assert_eq!(snapshot.severity_text, "DISCONNECTED");
    assert_eq!(snapshot.timestamp_text, "unknown");
    assert_eq!(snapshot.timestamp_epoch, 0);
    assert_eq!(snapshot.error.code, error_code(ErrorCondition::Disconn));
    assert_eq!(result.max_element_count, 0);
}

#[test]
fn test_whitespace_is_cut_from_names() {
    let client = LoopbackClient::new();
    client.add_pv("TEST:PV", 1.5f64).unwrap();
    let cache = start_cache(&client, false);
    let result = cache.read(&["  TEST:PV junk"], SECOND).unwrap();
    assert_eq!(result.snapshots[0].name, "TEST:PV");
    assert_eq!(result.snapshots[0].values, vec![1.5]);
}

#[test]
fn test_last_value_wins() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, false);
    assert_eq!(cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].values, vec![1.0]);

    pv.store_with_status(2.0f64, Status::new(3, 2)).unwrap();
    eventually("second sample", || {
        cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].values == vec![2.0]
    });
    let result = cache.read(&["TEST:PV"], SECOND).unwrap();
    let snapshot = &result.snapshots[0];
    assert_eq!(snapshot.values, vec![2.0]);
    assert_eq!(snapshot.status_text, "HIHI");
    assert_eq!(snapshot.severity_text, "MAJOR");
}

#[test]
fn test_disconnect_preserves_value() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 5.0f64).unwrap();
    let cache = start_cache(&client, false);
    let before = cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].clone();
    assert_eq!(before.values, vec![5.0]);

    pv.disconnect();
    eventually("disconnection", || {
        !cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].is_connected()
    });
    let after = cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].clone();
    assert_eq!(after.values, vec![5.0]);
    assert_eq!(after.strings, vec!["5"]);
    assert_eq!(after.timestamp, before.timestamp);
    assert_eq!(after.timestamp_text, before.timestamp_text);
    assert_eq!(after.status_text, "INVALID");
    assert_eq!(after.severity_text, "DISCONNECTED");
    assert_eq!(after.error.code, error_code(ErrorCondition::Disconn));

    pv.reconnect();
    eventually("reconnection", || {
        cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].error.code == 0
    });
}

#[test]
fn test_fields_are_separate_records() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("MOTOR", vec![1.0f64, 2.0, 3.0]).unwrap();
    pv.set_field("DESC", "Sample stage");
    pv.set_field("EGU", "mm");
    let cache = start_cache(&client, false);

    let result = cache
        .read_with_fields(&["MOTOR"], &["DESC", "EGU"], SECOND)
        .unwrap();
    let snapshot = &result.snapshots[0];
    assert_eq!(result.snapshots.len(), 1);
    assert_eq!(result.max_element_count, 3);
    assert_eq!(snapshot.values, vec![1.0, 2.0, 3.0]);
    assert_eq!(snapshot.field("DESC"), Some("Sample stage"));
    assert_eq!(snapshot.field("EGU"), Some("mm"));

    let info = cache.info().unwrap();
    let mut indices: Vec<usize> = info.pvs.iter().map(|p| p.index).collect();
    indices.sort();
    indices.dedup();
    assert_eq!(indices.len(), 3);
    let field_record = info.pvs.iter().find(|p| p.name == "MOTOR.DESC").unwrap();
    assert!(field_record.has_value);
    assert_eq!(field_record.strings, vec!["Sample stage"]);

    // Updating the attribute leaves the main value alone
    pv.set_field("DESC", "Detector stage");
    eventually("field update", || {
        let result = cache
            .read_with_fields(&["MOTOR"], &["DESC", "EGU"], SECOND)
            .unwrap();
        result.snapshots[0].field("DESC") == Some("Detector stage")
    });
    let result = cache.read(&["MOTOR"], SECOND).unwrap();
    assert_eq!(result.snapshots[0].values, vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_field_counts_towards_max_element_count() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("EMPTY", Vec::<f64>::new()).unwrap();
    pv.set_field("DESC", "Nothing yet");
    let cache = start_cache(&client, false);

    let result = cache
        .read_with_fields(&["EMPTY"], &["DESC"], SECOND)
        .unwrap();
    // Only the requested name is returned, but its field sets the widest row
    assert_eq!(result.snapshots.len(), 1);
    assert_eq!(result.snapshots[0].element_count, 0);
    assert_eq!(result.snapshots[0].field("DESC"), Some("Nothing yet"));
    assert_eq!(result.max_element_count, 1);
}

#[test]
fn test_enum_labels() {
    let client = LoopbackClient::new();
    let pv = client.add_enum_pv("MODE", 1, &["Off", "On", "Auto"]).unwrap();
    let cache = start_cache(&client, false);
    eventually("enum label", || {
        cache.read(&["MODE"], SECOND).unwrap().snapshots[0].strings == vec!["On"]
    });
    assert_eq!(cache.read(&["MODE"], SECOND).unwrap().snapshots[0].values, vec![1.0]);
    // The label subscription is dropped once the labels are known
    eventually("label subscription to close", || client.subscription_count() == 1);

    pv.store(DbrValue::Enum(2)).unwrap();
    eventually("enum update", || {
        cache.read(&["MODE"], SECOND).unwrap().snapshots[0].strings == vec!["Auto"]
    });
}

#[test]
fn test_synchronous_write() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("PV1", 0.0f64).unwrap();
    let cache = start_cache(&client, false);

    let result = cache
        .write(
            &["PV1"],
            &ValueBlock::doubles(1, 1, vec![3.14]).unwrap(),
            WriteKind::Double,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(result.error_for("PV1").unwrap().code, 0);
    assert_eq!(pv.load(), Some(DbrValue::Double(vec![3.14])));
    assert_eq!(pv.put_count(), 1);
}

#[test]
fn test_write_without_read() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("ONLY:WRITTEN", 0i32).unwrap();
    let cache = start_cache(&client, false);
    let result = cache
        .write(
            &["ONLY:WRITTEN"],
            &ValueBlock::integers(1, 1, vec![12]).unwrap(),
            WriteKind::Long,
            &WriteOptions::default(),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(pv.load(), Some(DbrValue::Long(vec![12])));
    assert!(cache.info().unwrap().pvs.is_empty());
    assert_eq!(cache.info().unwrap().write_channels, 1);
}

#[test]
fn test_single_row_is_one_value_per_name() {
    let client = LoopbackClient::new();
    let a = client.add_pv("A", 0.0f64).unwrap();
    let b = client.add_pv("B", 0.0f64).unwrap();
    let cache = start_cache(&client, false);

    let result = cache
        .write(
            &["A", "B"],
            &ValueBlock::doubles(1, 2, vec![1.0, 2.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(a.load(), Some(DbrValue::Double(vec![1.0])));
    assert_eq!(b.load(), Some(DbrValue::Double(vec![2.0])));
}

#[test]
fn test_rows_and_element_counts() {
    let client = LoopbackClient::new();
    let wave = client.add_pv("WAVE", vec![0.0f64; 3]).unwrap();
    let short = client.add_pv("SHORT", vec![0.0f64; 2]).unwrap();
    let cache = start_cache(&client, false);
    let block = ValueBlock::doubles(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

    let result = cache
        .write(
            &["WAVE", "SHORT"],
            &block,
            WriteKind::Double,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(wave.load(), Some(DbrValue::Double(vec![1.0, 2.0, 3.0])));
    // Only as many values as the channel holds
    assert_eq!(short.load(), Some(DbrValue::Double(vec![4.0, 5.0])));

    // Explicit column major: WAVE gets the first column, SHORT the second
    let options = WriteOptions {
        column_major: true,
        ..WriteOptions::synchronous(SECOND)
    };
    let result = cache
        .write(&["WAVE", "SHORT"], &block, WriteKind::Double, &options)
        .unwrap();
    assert!(result.ok());
    assert_eq!(wave.load(), Some(DbrValue::Double(vec![1.0, 4.0])));
    assert_eq!(short.load(), Some(DbrValue::Double(vec![2.0, 5.0])));
}

#[test]
fn test_names_without_values() {
    let client = LoopbackClient::new();
    let a = client.add_pv("A", 0.0f64).unwrap();
    client.add_pv("B", 0.0f64).unwrap();
    let cache = start_cache(&client, false);

    let result = cache
        .write(
            &["A", "B"],
            &ValueBlock::doubles(1, 1, vec![7.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(!result.ok());
    assert_eq!(result.error_for("A").unwrap().code, 0);
    assert_eq!(
        result.error_for("B").unwrap().code,
        error_code(ErrorCondition::BadCount)
    );
    assert_eq!(a.load(), Some(DbrValue::Double(vec![7.0])));
}

#[test]
fn test_string_writes_are_reencoded() {
    let client = LoopbackClient::new();
    let long = client.add_pv("LONG", 0i32).unwrap();
    let double = client.add_pv("DOUBLE", 0.0f64).unwrap();
    let mode = client.add_enum_pv("MODE", 0, &["Off", "On"]).unwrap();
    let cache = start_cache(&client, false);

    let block = ValueBlock::strings(
        1,
        3,
        vec!["12,7".to_string(), "2,5".to_string(), "On".to_string()],
    )
    .unwrap();
    let result = cache
        .write(
            &["LONG", "DOUBLE", "MODE"],
            &block,
            WriteKind::String,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(result.ok(), "{:?}", result.errors);
    assert_eq!(long.load(), Some(DbrValue::Long(vec![12])));
    assert_eq!(double.load(), Some(DbrValue::Double(vec![2.5])));
    assert_eq!(mode.load(), Some(DbrValue::Enum(1)));
}

#[test]
fn test_unrepresentable_write_fails_that_name() {
    let client = LoopbackClient::new();
    let small = client.add_pv("SMALL", 0i16).unwrap();
    let wide = client.add_pv("WIDE", 0i32).unwrap();
    let cache = start_cache(&client, false);

    let result = cache
        .write(
            &["SMALL", "WIDE"],
            &ValueBlock::integers(1, 2, vec![100_000, 100_000]).unwrap(),
            WriteKind::Long,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert_eq!(
        result.error_for("SMALL").unwrap().code,
        error_code(ErrorCondition::NoConvert)
    );
    assert_eq!(result.error_for("WIDE").unwrap().code, 0);
    assert_eq!(small.load(), Some(DbrValue::Int(vec![0])));
    assert_eq!(wide.load(), Some(DbrValue::Long(vec![100_000])));
}

#[test]
fn test_write_failures() {
    let client = LoopbackClient::new();
    let failing = client.add_pv("FAILING", 0.0f64).unwrap();
    failing.set_put_behaviour(PutBehaviour::Fail(ErrorCondition::PutFail));
    let silent = client.add_pv("SILENT", 0.0f64).unwrap();
    silent.set_put_behaviour(PutBehaviour::Ignore);
    let cache = start_cache(&client, false);

    let block = ValueBlock::doubles(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
    let start = Instant::now();
    let result = cache
        .write(
            &["FAILING", "SILENT", "MISSING"],
            &block,
            WriteKind::Double,
            &WriteOptions::synchronous(Duration::from_millis(300)),
        )
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!result.ok());
    assert_eq!(
        result.error_for("FAILING").unwrap().code,
        error_code(ErrorCondition::PutFail)
    );
    // No completion arrived in time
    assert_eq!(
        result.error_for("SILENT").unwrap().code,
        error_code(ErrorCondition::Disconn)
    );
    // Never connected
    assert_eq!(
        result.error_for("MISSING").unwrap().code,
        error_code(ErrorCondition::Disconn)
    );
    assert!(!result.error_for("MISSING").unwrap().message.is_empty());
    assert_eq!(silent.put_count(), 1);

    // Without waiting for completion only the issuing of the put is reported
    let result = cache
        .write(
            &["SILENT"],
            &ValueBlock::doubles(1, 1, vec![4.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::default(),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(silent.load(), Some(DbrValue::Double(vec![4.0])));
}

#[test]
fn test_channel_creation_failure() {
    let client = LoopbackClient::new();
    client.reject_channel("REJECTED", ErrorCondition::BadStr);
    let cache = start_cache(&client, false);

    let start = Instant::now();
    let result = cache.read(&["REJECTED"], Duration::from_secs(2)).unwrap();
    // The failure ends the wait for this PV
    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(
        result.snapshots[0].error.code,
        error_code(ErrorCondition::BadStr)
    );
    assert_eq!(client.channel_count(), 0);
}

#[test]
fn test_exception_is_recorded() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, false);
    cache.read(&["TEST:PV"], SECOND).unwrap();

    pv.raise_exception(ErrorCondition::GetFail, "read rejected");
    eventually("exception", || {
        cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].error.code
            == error_code(ErrorCondition::GetFail)
    });
    let snapshot = cache.read(&["TEST:PV"], SECOND).unwrap().snapshots[0].clone();
    assert!(snapshot.error.message.contains("read rejected"));
    assert_eq!(snapshot.values, vec![1.0]);
}

#[test]
fn test_polling_mode_starts_cold() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, true);
    assert!(cache.is_polling());
    // Records do not outlive a read, so there is nothing to push from
    assert!(matches!(
        cache.subscribe("TEST:PV"),
        Err(CacheError::InvalidInput(_))
    ));

    let result = cache.read(&["TEST:PV"], SECOND).unwrap();
    assert_eq!(result.snapshots[0].values, vec![1.0]);
    assert_eq!(client.channel_count(), 0);
    assert!(cache.info().unwrap().pvs.is_empty());

    pv.store(2.0f64).unwrap();
    let result = cache.read(&["TEST:PV"], SECOND).unwrap();
    assert_eq!(result.snapshots[0].values, vec![2.0]);

    let result = cache
        .write(
            &["TEST:PV"],
            &ValueBlock::doubles(1, 1, vec![3.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(cache.info().unwrap().write_channels, 0);
    assert_eq!(client.channel_count(), 0);
}

#[test]
fn test_repeated_name_shares_write_channel() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("A", 0.0f64).unwrap();
    let cache = start_cache(&client, true);

    let result = cache
        .write(
            &["A", "A"],
            &ValueBlock::doubles(2, 1, vec![1.0, 2.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::synchronous(SECOND),
        )
        .unwrap();
    assert!(result.ok());
    assert_eq!(pv.put_count(), 2);
    assert_eq!(pv.load(), Some(DbrValue::Double(vec![2.0])));
    // Polling mode ends the batch with nothing left open
    assert_eq!(cache.info().unwrap().write_channels, 0);
    assert_eq!(client.channel_count(), 0);
}

/// Time a read of one PV while a slow synchronous write is in flight
fn read_during_slow_write(polling: bool) -> Duration {
    let client = LoopbackClient::new();
    let slow = client.add_pv("SLOW", 0.0f64).unwrap();
    slow.set_put_behaviour(PutBehaviour::Ignore);
    client.add_pv("FAST", 1.0f64).unwrap();
    let cache = start_cache(&client, polling);

    thread::scope(|s| {
        s.spawn(|| {
            cache
                .write(
                    &["SLOW"],
                    &ValueBlock::doubles(1, 1, vec![1.0]).unwrap(),
                    WriteKind::Double,
                    &WriteOptions::synchronous(Duration::from_millis(600)),
                )
                .unwrap();
        });
        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        let result = cache.read(&["FAST"], SECOND).unwrap();
        assert_eq!(result.snapshots[0].values, vec![1.0]);
        start.elapsed()
    })
}

#[test]
fn test_polling_mode_serialises_reads_and_writes() {
    let elapsed = read_during_slow_write(true);
    assert!(elapsed >= Duration::from_millis(350), "{elapsed:?}");
}

#[test]
fn test_event_mode_reads_and_writes_concurrently() {
    let elapsed = read_during_slow_write(false);
    assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
}

#[test]
fn test_remove_pvs() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 1.0f64).unwrap();
    pv.set_field("DESC", "A value");
    client.add_pv("TEST:PV2", 2.0f64).unwrap();
    let cache = start_cache(&client, false);
    cache
        .read_with_fields(&["TEST:PV", "TEST:PV2"], &["DESC"], SECOND)
        .unwrap();
    let index = cache.register("TEST:PV").unwrap();

    // TEST:PV and TEST:PV.DESC, but not TEST:PV2
    assert_eq!(cache.remove_pvs(&["TEST:PV"]).unwrap(), 2);
    let info = cache.info().unwrap();
    assert_eq!(info.pvs.len(), 4);
    let removed = info.pvs.iter().find(|p| p.name == "TEST:PV").unwrap();
    assert!(!removed.has_value);
    assert!(removed.values.is_empty());
    assert_eq!(removed.severity_text, "DISCONNECTED");
    let kept = info.pvs.iter().find(|p| p.name == "TEST:PV2").unwrap();
    assert!(kept.has_value);

    // Reading again connects it again, in the same slot
    pv.store(3.0f64).unwrap();
    let result = cache.read(&["TEST:PV"], SECOND).unwrap();
    assert_eq!(result.snapshots[0].values, vec![3.0]);
    assert_eq!(result.snapshots[0].index, index);
}

#[test]
fn test_shutdown() {
    let client = LoopbackClient::new();
    client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, false);
    cache.read(&["TEST:PV"], SECOND).unwrap();
    cache
        .write(
            &["TEST:PV"],
            &ValueBlock::doubles(1, 1, vec![2.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::default(),
        )
        .unwrap();
    assert_eq!(client.channel_count(), 2);

    cache.shutdown();
    assert_eq!(client.channel_count(), 0);
    assert_eq!(
        cache.read(&["TEST:PV"], SECOND).unwrap_err(),
        CacheError::ShuttingDown
    );
    assert_eq!(
        cache.register("OTHER").unwrap_err(),
        CacheError::ShuttingDown
    );
    assert!(matches!(cache.info(), Err(CacheError::ShuttingDown)));
    assert!(matches!(
        cache.write(
            &["TEST:PV"],
            &ValueBlock::doubles(1, 1, vec![2.0]).unwrap(),
            WriteKind::Double,
            &WriteOptions::default(),
        ),
        Err(CacheError::ShuttingDown)
    ));
}

#[test]
fn test_invalid_input() {
    let client = LoopbackClient::new();
    let cache = start_cache(&client, false);
    assert!(matches!(
        cache.read(&[] as &[&str], SECOND),
        Err(CacheError::InvalidInput(_))
    ));
    assert!(matches!(
        cache.read(&["   "], SECOND),
        Err(CacheError::InvalidInput(_))
    ));
    assert!(matches!(
        cache.write(
            &["PV"],
            &ValueBlock::strings(1, 1, vec!["1".to_string()]).unwrap(),
            WriteKind::Double,
            &WriteOptions::default(),
        ),
        Err(CacheError::InvalidInput(_))
    ));
    assert_eq!(WriteKind::try_from(9), Err(CacheError::UnknownDataType(9)));
    // Nothing was registered or connected
    assert!(cache.info().unwrap().pvs.is_empty());
    assert_eq!(client.channel_count(), 0);
}

#[test]
fn test_info() {
    let client = LoopbackClient::new();
    client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, false);
    cache.read(&["TEST:PV"], SECOND).unwrap();
    let info = cache.info().unwrap();
    assert!(!info.polling);
    assert!(
        info.settings
            .iter()
            .any(|(k, v)| k == "polling" && v == "false")
    );
    for name in pvcache::EPICS_CA_ENVIRONMENT {
        assert!(info.settings.iter().any(|(k, _)| k == name));
    }
    assert_eq!(info.pvs.len(), 1);
    assert_eq!(info.pvs[0].values, vec![1.0]);
}

/// Receive until a snapshot carries the given value
async fn next_with(updates: &mut Subscription, value: f64) -> PvSnapshot {
    loop {
        let snapshot = updates.recv().await.unwrap();
        if snapshot.values == vec![value] {
            return snapshot;
        }
    }
}

#[tokio::test]
async fn test_push_notifications() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, false);

    let mut updates = cache.subscribe("TEST:PV").unwrap();
    // The current state comes first, whether or not there is a value yet
    let first = updates.recv().await.unwrap();
    assert_eq!(first.name, "TEST:PV");
    if first.values != vec![1.0] {
        let snapshot = tokio::time::timeout(Duration::from_secs(2), next_with(&mut updates, 1.0))
            .await
            .expect("Did not get first value");
        assert!(snapshot.has_value);
    }

    pv.store(2.0f64).unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), next_with(&mut updates, 2.0))
        .await
        .expect("Did not get update");
    assert_eq!(snapshot.strings, vec!["2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_read_and_write() {
    let client = LoopbackClient::new();
    let pv = client.add_pv("TEST:PV", 1.0f64).unwrap();
    let cache = start_cache(&client, false);

    let result = cache
        .read_async(vec!["TEST:PV".to_string()], Vec::new(), SECOND)
        .await
        .unwrap();
    assert_eq!(result.snapshots[0].values, vec![1.0]);

    let result = cache
        .write_async(
            vec!["TEST:PV".to_string()],
            ValueBlock::doubles(1, 1, vec![8.0]).unwrap(),
            WriteKind::Double,
            WriteOptions::synchronous(SECOND),
        )
        .await
        .unwrap();
    assert!(result.ok());
    assert_eq!(pv.load(), Some(DbrValue::Double(vec![8.0])));
}
