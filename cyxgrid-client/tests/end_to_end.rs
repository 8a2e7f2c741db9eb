//! End-to-end integration tests for CyxGrid
//!
//! Tests the complete pipeline over an in-memory endpoint pool:
//! object → segments → seal → encode → place → fetch → decode → unseal → object
//!
//! Run with: cargo test --test end_to_end

use bytes::Bytes;
use cyxgrid_client::{
    permute_endpoints, DiversityPolicy, Endpoint, EndpointId, GridConfig, MemoryTransport,
    Orchestrator, PlacementPlanner,
};
use cyxgrid_core::{Capability, CapabilityKind, CodingParams, GridError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const MIB: usize = 1024 * 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Generate test object data of specified size
fn generate_object(size: usize) -> Bytes {
    // Use a pattern that's easy to verify
    Bytes::from((0..size).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>())
}

fn endpoint_pool(count: usize) -> Vec<Endpoint> {
    (0..count)
        .map(|i| Endpoint::in_group(format!("node-{}", i), format!("site-{}", i)))
        .collect()
}

fn orchestrator(
    transport: &Arc<MemoryTransport>,
    endpoints: Vec<Endpoint>,
    config: GridConfig,
) -> Orchestrator {
    Orchestrator::new(transport.clone(), endpoints, config).unwrap()
}

fn isolate(transport: &MemoryTransport, endpoints: &[Endpoint], keep: &[usize]) {
    for (i, endpoint) in endpoints.iter().enumerate() {
        transport.set_unreachable(&endpoint.id, !keep.contains(&i));
    }
}

/// k=3, n=10, 1 MiB: any 3 endpoints reconstruct, 2 do not
#[tokio::test]
async fn test_any_three_of_ten_endpoints() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(10);
    let params = CodingParams::new(3, 10).unwrap();
    let data = generate_object(MIB);

    let cap = orchestrator(&transport, endpoints.clone(), GridConfig::default())
        .upload(data.clone(), params, DiversityPolicy::DistinctGroups)
        .await
        .unwrap();
    for endpoint in &endpoints {
        // 8 segments of 128 KiB, one share each
        assert_eq!(transport.share_count(&endpoint.id), 8);
    }

    for keep in [[0, 1, 2], [7, 8, 9], [1, 4, 8]] {
        isolate(&transport, &endpoints, &keep);
        let reader = orchestrator(&transport, endpoints.clone(), GridConfig::default());
        let downloaded = reader.download(&cap).await.unwrap();
        assert_eq!(downloaded, data, "endpoints {:?} failed to reconstruct", keep);
    }

    isolate(&transport, &endpoints, &[3, 6]);
    let reader = orchestrator(&transport, endpoints.clone(), GridConfig::default());
    match reader.download(&cap).await {
        Err(GridError::InsufficientShares {
            available,
            required,
            missing,
            ..
        }) => {
            assert_eq!(available, 2);
            assert_eq!(required, 3);
            assert_eq!(missing.len(), 8);
        }
        other => panic!("expected InsufficientShares, got {:?}", other.map(|b| b.len())),
    }
}

#[tokio::test]
async fn test_corrupting_endpoints_are_routed_around() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(10);
    let params = CodingParams::new(3, 10).unwrap();
    let data = generate_object(300 * 1024);
    let grid = orchestrator(&transport, endpoints.clone(), GridConfig::default());

    let cap = grid
        .upload(data.clone(), params, DiversityPolicy::DistinctGroups)
        .await
        .unwrap();

    for endpoint in &endpoints[..5] {
        transport.set_corrupting(&endpoint.id, true);
    }
    assert_eq!(grid.download(&cap).await.unwrap(), data);

    let report = grid.check(&cap.to_verify_cap()).await.unwrap();
    assert_eq!(report.num_segments, Some(3));
    for segment in &report.segments {
        assert_eq!(segment.valid.len(), 5);
        assert_eq!(segment.corrupt.len(), 5);
        assert!(segment.missing.is_empty());
    }
    assert!(report.is_recoverable());
    assert!(!report.is_healthy());
}

#[tokio::test]
async fn test_diversity_fallback_eight_plus_two() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    // 8 distinct sites, then two more endpoints in sites already used
    let mut endpoints = endpoint_pool(8);
    endpoints.push(Endpoint::in_group("node-8", "site-0"));
    endpoints.push(Endpoint::in_group("node-9", "site-1"));
    let params = CodingParams::new(3, 10).unwrap();

    let grid = orchestrator(&transport, endpoints.clone(), GridConfig::default());
    let data = generate_object(64 * 1024);
    let cap = grid
        .upload(data.clone(), params, DiversityPolicy::DistinctGroups)
        .await
        .unwrap();

    // Every endpoint took exactly one share
    for endpoint in &endpoints {
        assert_eq!(transport.share_count(&endpoint.id), 1);
    }
    assert_eq!(grid.download(&cap).await.unwrap(), data);

    // Same plan the upload used
    let permuted = permute_endpoints(&endpoints, &cap.storage_index());
    let map = PlacementPlanner::plan(10, &permuted, &DiversityPolicy::DistinctGroups).unwrap();
    assert_eq!(map.fallback_indices().len(), 2);
    for index in map.fallback_indices() {
        assert!(index >= 8);
    }
}

#[tokio::test]
async fn test_upload_cancellation() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(10);
    for endpoint in &endpoints {
        transport.set_latency(&endpoint.id, Duration::from_millis(200));
    }
    let grid = orchestrator(&transport, endpoints, GridConfig::default());
    let params = CodingParams::new(3, 10).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = grid
        .upload_with_cancel(generate_object(MIB), params, DiversityPolicy::Any, &cancel)
        .await;
    assert!(matches!(result, Err(GridError::Cancelled)));
}

#[tokio::test]
async fn test_download_cancellation() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(10);
    let grid = orchestrator(&transport, endpoints.clone(), GridConfig::default());
    let params = CodingParams::new(3, 10).unwrap();

    let cap = grid
        .upload(generate_object(MIB), params, DiversityPolicy::Any)
        .await
        .unwrap();

    for endpoint in &endpoints {
        transport.set_latency(&endpoint.id, Duration::from_millis(200));
    }
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = grid.download_with_cancel(&cap, &cancel).await;
    assert!(matches!(result, Err(GridError::Cancelled)));
    // In-flight gets are abandoned rather than awaited
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_mutable_slot_reads_newest_version() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(10);
    let config = GridConfig {
        shares_happy: Some(8),
        max_put_attempts: 2,
        ..Default::default()
    };
    let grid = orchestrator(&transport, endpoints.clone(), config);
    let params = CodingParams::new(3, 10).unwrap();

    let write_cap = grid
        .create_mutable(generate_object(200 * 1024), params, DiversityPolicy::Any)
        .await
        .unwrap();
    assert_eq!(write_cap.kind(), CapabilityKind::Write);

    // Two endpoints miss the second version and keep serving the first
    transport.set_unreachable(&endpoints[0].id, true);
    transport.set_unreachable(&endpoints[1].id, true);
    let second = Bytes::from_static(b"second version of the slot");
    let seqnum = grid
        .publish(&write_cap, second.clone(), DiversityPolicy::Any)
        .await
        .unwrap();
    assert_eq!(seqnum, 2);
    transport.set_unreachable(&endpoints[0].id, false);
    transport.set_unreachable(&endpoints[1].id, false);

    let read_cap = Capability::parse(&write_cap.to_read_cap().unwrap().to_string()).unwrap();
    let reader = orchestrator(&transport, endpoints, GridConfig::default());
    assert_eq!(reader.download(&read_cap).await.unwrap(), second);

    let report = reader.check(&read_cap.to_verify_cap()).await.unwrap();
    assert_eq!(report.version, Some(2));
    assert_eq!(report.segments[0].valid.len(), 8);
}

#[tokio::test]
async fn test_verify_only_capability() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(10);
    let grid = orchestrator(&transport, endpoints.clone(), GridConfig::default());
    let params = CodingParams::new(3, 10).unwrap();

    let cap = grid
        .upload(generate_object(150 * 1024), params, DiversityPolicy::DistinctGroups)
        .await
        .unwrap();
    let token = cap.attenuate(CapabilityKind::Verify).unwrap().to_string();
    let verify_cap: Capability = token.parse().unwrap();
    assert!(verify_cap.read_key().is_none());
    assert!(grid.verify(&verify_cap).await.unwrap());

    for endpoint in &endpoints[..8] {
        transport.wipe(&endpoint.id);
    }
    assert!(!grid.verify(&verify_cap).await.unwrap());
    let report = grid.check(&verify_cap).await.unwrap();
    assert_eq!(report.segments[0].missing.len(), 8);
}

#[tokio::test]
async fn test_open_endpoints_excluded_from_placement() {
    init_tracing();
    let transport = Arc::new(MemoryTransport::new());
    let endpoints = endpoint_pool(12);
    let config = GridConfig {
        breaker: cyxgrid_client::BreakerSettings {
            failure_threshold: 1,
            recovery_ms: 60_000,
        },
        ..Default::default()
    };
    let grid = orchestrator(&transport, endpoints.clone(), config);
    let params = CodingParams::new(3, 10).unwrap();

    let down = EndpointId::new("node-0");
    grid.health().record_failure(&down);

    grid.upload(generate_object(10_000), params, DiversityPolicy::DistinctGroups)
        .await
        .unwrap();
    assert_eq!(transport.share_count(&down), 0);
}
