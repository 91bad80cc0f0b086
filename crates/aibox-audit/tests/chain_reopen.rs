//! End-to-end chain behavior across logger restarts and file tampering.

use aibox_audit::{
    AuditEvent, AuditLogger, AuditLoggerOptions, EventKind, GENESIS_HASH, read_events,
    verify_chain,
};
use aibox_types::Severity;
use tempfile::tempdir;

fn event(kind: EventKind) -> AuditEvent {
    AuditEvent::new(kind, "aibox-alice-0011223344aa", "alice", "lifecycle", Severity::Info)
}

#[test]
fn chain_survives_close_and_reopen() {
    let td = tempdir().expect("tempdir");
    let path = td.path().join("audit.jsonl");

    let logger = AuditLogger::open(AuditLoggerOptions::new(&path).max_size(0)).expect("open");
    for _ in 0..5 {
        logger.log(event(EventKind::ToolAllowed)).expect("log");
    }
    logger.close().expect("close");

    let logger = AuditLogger::open(AuditLoggerOptions::new(&path).max_size(0)).expect("reopen");
    for _ in 0..5 {
        logger.log(event(EventKind::NetworkAllowed)).expect("log");
    }
    logger.close().expect("close");

    let events = read_events(&path).expect("read");
    assert_eq!(events.len(), 10);

    let verification = verify_chain(&events, GENESIS_HASH);
    assert!(verification.intact, "reopened chain must stay intact: {verification:?}");
    assert_eq!(verification.verified, 10);
}

#[test]
fn tampering_with_stored_event_is_detected() {
    let td = tempdir().expect("tempdir");
    let path = td.path().join("audit.jsonl");

    let logger = AuditLogger::open(AuditLoggerOptions::new(&path)).expect("open");
    for _ in 0..5 {
        logger.log(event(EventKind::ToolAllowed)).expect("log");
    }
    logger.close().expect("close");

    let mut events = read_events(&path).expect("read");
    events[2]
        .details
        .insert("injected".to_string(), "oops".into());

    let verification = verify_chain(&events, GENESIS_HASH);
    assert!(!verification.intact);
    assert_eq!(verification.broken_at, Some(3));

    let mut events = read_events(&path).expect("read");
    events[1].hash_prev = "f".repeat(64);

    let verification = verify_chain(&events, GENESIS_HASH);
    assert!(!verification.intact);
    assert_eq!(verification.broken_at, Some(1));
}

#[test]
fn corrupted_tail_restarts_chain_from_genesis_with_working_logger() {
    let td = tempdir().expect("tempdir");
    let path = td.path().join("audit.jsonl");

    let logger = AuditLogger::open(AuditLoggerOptions::new(&path)).expect("open");
    logger.log(event(EventKind::SandboxStart)).expect("log");
    logger.close().expect("close");

    // Smash the last line.
    let mut content = std::fs::read_to_string(&path).expect("read");
    content.push_str("corrupted tail line\n");
    std::fs::write(&path, &content).expect("write");

    let logger = AuditLogger::open(AuditLoggerOptions::new(&path)).expect("reopen");
    let appended = logger.log(event(EventKind::SandboxStop)).expect("log");
    logger.close().expect("close");

    // Recovery could not parse the tail, so the chain restarted.
    assert_eq!(appended.hash_prev, GENESIS_HASH);
}
