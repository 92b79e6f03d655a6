//! End-to-end scenarios through the SheetGuard facade.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use sheetguard_common::clock::ManualClock;
use sheetguard_common::config::{DiffConfig, GuardConfig};
use sheetguard_common::types::{A1Range, DocumentId, DocumentVersion, ExpectedState};
use sheetguard_common::ErrorCode;
use sheetguard_core::diff::DiffEngine;
use sheetguard_core::{
    ConflictQuery, ConflictType, EffectLimits, MutationRequest, ResolutionStrategy, RestoreOptions,
    SheetGuard, Since, TierKind, TxnOptions, TxnState,
};
use sheetguard_executor::{actions, EffectShape, ExecCall, MemoryExecutor, OpDescriptor};

fn setup(rows: u32, cols: u32) -> (Arc<MemoryExecutor>, SheetGuard, DocumentId) {
    let exec = MemoryExecutor::shared();
    let doc = DocumentId::new("S1");
    exec.add_document(&doc, &[("Sheet1", rows, cols), ("Data", 20, 4)]);
    let guard = SheetGuard::builder()
        .executor(exec.clone())
        .config(GuardConfig::for_testing())
        .clock(ManualClock::shared(1_000))
        .build()
        .unwrap();
    (exec, guard, doc)
}

fn range(s: &str) -> A1Range {
    s.parse().unwrap()
}

fn block(rows: usize, cols: usize, value: &str) -> Vec<Vec<Value>> {
    vec![vec![json!(value); cols]; rows]
}

fn write(at: &str, values: Vec<Vec<Value>>) -> MutationRequest {
    MutationRequest::new("S1", actions::write_range(range(at), values))
}

#[tokio::test]
async fn stale_version_is_rejected_with_version_mismatch() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let seen_by_a = guard.fingerprint(&doc, None, &cancel).await.unwrap();
    let seen_by_b = guard.fingerprint(&doc, None, &cancel).await.unwrap();
    assert_eq!(seen_by_a.version, DocumentVersion::new(1));

    let a = write("Sheet1!A1", block(1, 1, "a")).expect_version(seen_by_a.version);
    let applied = guard.guarded_mutate(a, &cancel).await.unwrap().applied().unwrap();
    assert_eq!(applied.summary.version_after, DocumentVersion::new(2));

    let mutating = exec.mutating_calls();
    let b = write("Sheet1!A1", block(1, 1, "b")).expect_version(seen_by_b.version);
    let err = guard.guarded_mutate(b, &cancel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    let fields: Vec<&str> = err.mismatched_fields().iter().map(|m| m.field.as_str()).collect();
    assert_eq!(fields, vec!["version"]);
    assert_eq!(exec.mutating_calls(), mutating);
    assert_eq!(exec.cell_text(&doc, "Sheet1!A1").unwrap(), "a");
}

#[tokio::test]
async fn fence_passes_only_when_every_supplied_field_matches() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let live = guard.fingerprint(&doc, None, &cancel).await.unwrap();
    let exact = live.to_expected();

    let mut cases: Vec<(ExpectedState, &str)> = Vec::new();
    let mut e = exact.clone();
    e.version = Some(live.version.next());
    cases.push((e, "version"));
    let mut e = exact.clone();
    e.row_count = Some(live.row_count + 1);
    cases.push((e, "row_count"));
    let mut e = exact.clone();
    e.sheet_title = Some("Other".into());
    cases.push((e, "sheet_title"));
    let mut e = exact.clone();
    e.checksum = Some(live.checksum ^ 1);
    cases.push((e, "checksum"));

    for (expected, field) in cases {
        let request = write("Sheet1!A1", block(1, 1, "x")).expect(expected);
        let err = guard.guarded_mutate(request, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed, "{field}");
        assert_eq!(err.mismatched_fields()[0].field, field);
    }
    assert_eq!(exec.mutating_calls(), 0);

    let request = write("Sheet1!A1", block(1, 1, "x")).expect(exact);
    assert!(guard.guarded_mutate(request, &cancel).await.unwrap().applied().is_some());
}

#[tokio::test]
async fn dry_run_never_calls_the_executor() {
    let (exec, guard, _doc) = setup(100, 10);
    let cancel = CancellationToken::new();

    let small = guard.dry_run(&write("Sheet1!A1", block(2, 2, "x"))).unwrap();
    assert_eq!(small.estimate.cells_affected, 4);
    assert_eq!(small.diff_tier, TierKind::Full);

    let wide = MutationRequest::new("S1", actions::clear_range(range("Sheet1!A1:J100")))
        .with_limits(EffectLimits::max_cells(100));
    let err = guard.dry_run(&wide).unwrap_err();
    assert_eq!(err.code(), ErrorCode::EffectScopeExceeded);

    let outcome = guard
        .guarded_mutate(write("Sheet1!A1", block(3, 3, "x")).dry_run(), &cancel)
        .await
        .unwrap();
    assert!(outcome.dry_run().is_some());
    assert_eq!(exec.total_calls(), 0);
}

#[test]
fn diff_tier_never_shrinks_as_cells_grow() {
    let engine = DiffEngine::new(DiffConfig::default());
    let mut last = TierKind::Full;
    for cells in (0..20_000u64).step_by(37) {
        let tier = engine.select_tier(cells);
        assert!(tier >= last, "{cells} cells gave {tier:?} after {last:?}");
        last = tier;
    }
    assert_eq!(last, TierKind::Metadata);
}

#[tokio::test]
async fn snapshot_restore_reproduces_creation_checksum() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    guard
        .guarded_mutate(write("Sheet1!A1", block(3, 3, "seed")), &cancel)
        .await
        .unwrap();
    let snapshot = guard.snapshots().create(&doc, Some("checkpoint"), false, &cancel).await.unwrap();
    let at_creation = snapshot.fingerprint_at_creation.checksum;

    guard
        .guarded_mutate(write("Sheet1!B2", block(4, 4, "later")), &cancel)
        .await
        .unwrap();
    assert_ne!(exec.checksum(&doc).unwrap(), at_creation);

    let restored = guard
        .snapshots()
        .restore(snapshot.id, RestoreOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(restored.checksum, at_creation);
    assert_eq!(exec.checksum(&doc).unwrap(), at_creation);
}

#[tokio::test]
async fn restore_of_stale_snapshot_needs_force_after_outside_edit() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let snapshot = guard.snapshots().create(&doc, None, false, &cancel).await.unwrap();
    exec.external_write(&doc, &range("Sheet1!C3"), &block(1, 1, "outside")).unwrap();

    let err = guard
        .snapshots()
        .restore(snapshot.id, RestoreOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SnapshotRestoreFailed);
    assert_eq!(exec.cell_text(&doc, "Sheet1!C3").unwrap(), "outside");

    guard
        .snapshots()
        .restore(snapshot.id, RestoreOptions::forced(), &cancel)
        .await
        .unwrap();
    assert_eq!(exec.cell_text(&doc, "Sheet1!C3").unwrap(), "");
}

#[tokio::test]
async fn oversized_queued_write_fails_commit_before_anything_applies() {
    let (exec, guard, doc) = setup(1_000, 26);
    let cancel = CancellationToken::new();
    let txn = guard.begin_transaction(&doc, TxnOptions::default(), &cancel).await.unwrap();
    assert_eq!(guard.status(txn).unwrap().state, TxnState::Pending);

    guard.queue(txn, write("Sheet1!A1", block(1, 2, "one"))).unwrap();
    guard.queue(txn, write("Sheet1!A2", block(1, 2, "two"))).unwrap();
    let oversized = write("Sheet1!A10", block(50, 10, "big")).with_limits(EffectLimits::max_cells(100));
    guard.queue(txn, oversized).unwrap();

    let mutating = exec.mutating_calls();
    let err = guard.commit(txn, &cancel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::EffectScopeExceeded);
    assert_eq!(exec.version(&doc).unwrap(), DocumentVersion::new(1));
    assert_eq!(exec.mutating_calls(), mutating);
    assert_eq!(exec.cell_text(&doc, "Sheet1!A1").unwrap(), "");

    let status = guard.status(txn).unwrap();
    assert_eq!(status.state, TxnState::RolledBack);
    assert_eq!(status.report.unwrap().failed_op, Some(2));
}

#[tokio::test]
async fn transaction_is_all_or_nothing() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let before = exec.checksum(&doc).unwrap();

    let txn = guard.begin_transaction(&doc, TxnOptions::default(), &cancel).await.unwrap();
    guard.queue(txn, write("Sheet1!A1", block(2, 2, "x"))).unwrap();
    guard.queue(txn, write("Sheet1!C1", block(2, 2, "y"))).unwrap();
    let unsupported = OpDescriptor::new("explode", EffectShape::Range { range: range("Sheet1!E1") });
    guard.queue(txn, MutationRequest::new("S1", unsupported)).unwrap();

    let err = guard.commit(txn, &cancel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExecutorFailed);
    assert_eq!(exec.call_count(ExecCall::ApplyMutation), 3);

    assert_eq!(exec.checksum(&doc).unwrap(), before);
    let status = guard.status(txn).unwrap();
    assert_eq!(status.state, TxnState::RolledBack);
    assert_eq!(status.report.unwrap().applied.len(), 2);
    assert!(guard.transactions().active(&doc).is_none());
}

#[tokio::test]
async fn concurrent_writes_are_detected_and_resolved_keep_remote() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let v1 = guard.fingerprint(&doc, None, &cancel).await.unwrap().version;

    guard
        .guarded_mutate(write("Sheet1!A1:B2", block(2, 2, "alice")).with_session("alice"), &cancel)
        .await
        .unwrap();
    guard
        .guarded_mutate(write("Sheet1!A1:B2", block(2, 2, "bob")).with_session("bob"), &cancel)
        .await
        .unwrap();

    let query = ConflictQuery::new("S1", range("Sheet1!A1:B2"), Since::Version(v1)).with_session("alice");
    let conflicts = guard.detect_conflicts(&query, &cancel).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::ConcurrentWrite);
    assert_eq!(guard.list_conflicts(&doc).len(), 1);

    let version_before = exec.version(&doc).unwrap();
    let resolution = guard
        .resolve_conflict(conflict.id, ResolutionStrategy::KeepRemote, None, &cancel)
        .await
        .unwrap();
    assert!(resolution.version > version_before);
    assert_eq!(exec.cell_text(&doc, "Sheet1!A1").unwrap(), "bob");
    assert_eq!(exec.cell_text(&doc, "Sheet1!B2").unwrap(), "bob");
    assert!(guard.list_conflicts(&doc).is_empty());
}

#[tokio::test]
async fn conflict_resolution_waits_for_open_transaction_and_survives_lost_response() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let v1 = guard.fingerprint(&doc, None, &cancel).await.unwrap().version;

    guard
        .guarded_mutate(write("Sheet1!A1", block(1, 1, "alice")).with_session("alice"), &cancel)
        .await
        .unwrap();
    guard
        .guarded_mutate(write("Sheet1!A1", block(1, 1, "bob")).with_session("bob"), &cancel)
        .await
        .unwrap();
    let query = ConflictQuery::new("S1", range("Sheet1!A1"), Since::Version(v1)).with_session("alice");
    let conflict = guard.detect_conflicts(&query, &cancel).await.unwrap().remove(0);

    let txn = guard.begin_transaction(&doc, TxnOptions::default(), &cancel).await.unwrap();
    let err = guard
        .resolve_conflict(conflict.id, ResolutionStrategy::KeepLocal, None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransactionConflict);
    assert_eq!(exec.cell_text(&doc, "Sheet1!A1").unwrap(), "bob");
    guard.rollback(txn).unwrap();

    exec.lose_next_response(ExecCall::WriteCells);
    guard
        .resolve_conflict(conflict.id, ResolutionStrategy::KeepLocal, None, &cancel)
        .await
        .unwrap();
    assert_eq!(exec.call_count(ExecCall::WriteCells), 1);
    assert_eq!(exec.cell_text(&doc, "Sheet1!A1").unwrap(), "alice");
    assert!(guard.list_conflicts(&doc).is_empty());
}

#[tokio::test]
async fn lost_response_is_not_applied_twice() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    exec.lose_next_response(ExecCall::ApplyMutation);

    let response = guard
        .guarded_mutate(write("Sheet1!A1", block(1, 1, "once")), &cancel)
        .await
        .unwrap()
        .applied()
        .unwrap();

    assert_eq!(exec.call_count(ExecCall::ApplyMutation), 1);
    assert!(exec.call_count(ExecCall::FindApplied) >= 1);
    assert_eq!(response.summary.version_after, DocumentVersion::new(2));
    assert_eq!(exec.version(&doc).unwrap(), DocumentVersion::new(2));
}

#[tokio::test]
async fn named_sheet_targets_are_sized_against_their_own_sheet() {
    let (exec, guard, doc) = setup(100, 10);
    let cancel = CancellationToken::new();
    let request = write("Data!A1", block(2, 2, "d"));
    let response = guard.guarded_mutate(request, &cancel).await.unwrap().applied().unwrap();
    assert_eq!(response.summary.cells_affected, 4);
    assert_eq!(exec.cell_text(&doc, "Data!B2").unwrap(), "d");
    assert_eq!(exec.cell_text(&doc, "Sheet1!B2").unwrap(), "");
}
