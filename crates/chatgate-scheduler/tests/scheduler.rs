use std::sync::Arc;
use std::time::Duration;

use chatgate_common::CryptoMode;
use chatgate_scheduler::{AttemptError, ProviderScheduler, RetryError, SchedulerConfig, SchedulerError};
use chatgate_storage::{CredentialCipher, NewProvider, ProviderStatus, SeaOrmStorage, Storage};

async fn setup(providers: &[(&str, i32)]) -> (Arc<SeaOrmStorage>, ProviderScheduler, Vec<i64>) {
    let cipher = CredentialCipher::new(&[3u8; 32], CryptoMode::Passthrough).unwrap();
    let storage = Arc::new(
        SeaOrmStorage::connect("sqlite::memory:", cipher)
            .await
            .unwrap(),
    );
    storage.sync().await.unwrap();

    let mut ids = Vec::new();
    for (name, max_concurrent) in providers {
        let id = storage
            .insert_provider(NewProvider {
                name: name.to_string(),
                group_id: None,
                csesidx: format!("csx-{name}"),
                cookies: "cookie".to_string(),
                max_concurrent: *max_concurrent,
            })
            .await
            .unwrap();
        ids.push(id);
    }

    let scheduler = ProviderScheduler::new(
        storage.clone() as Arc<dyn Storage>,
        SchedulerConfig {
            cooldown: Duration::from_millis(50),
            ..SchedulerConfig::default()
        },
    );
    (storage, scheduler, ids)
}

#[tokio::test]
async fn acquire_increments_and_release_restores() {
    let (storage, scheduler, ids) = setup(&[("p1", 10)]).await;

    let provider = scheduler.acquire(None, &[]).await.unwrap();
    assert_eq!(provider.id, ids[0]);
    let row = storage.provider_by_id(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.current_load, 1);

    scheduler.release(ids[0]).await;
    let row = storage.provider_by_id(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.current_load, 0);
}

#[tokio::test]
async fn empty_pool_is_no_available_provider() {
    let (_storage, scheduler, _ids) = setup(&[]).await;
    assert!(matches!(
        scheduler.acquire(None, &[]).await,
        Err(SchedulerError::NoAvailableProvider)
    ));
}

#[tokio::test]
async fn exclusion_skips_failed_candidate() {
    let (_storage, scheduler, ids) = setup(&[("p1", 10), ("p2", 10)]).await;
    let provider = scheduler.acquire(None, &[ids[0]]).await.unwrap();
    assert_eq!(provider.id, ids[1]);
}

#[tokio::test]
async fn with_retry_substitutes_and_balances_load() {
    let (storage, scheduler, ids) = setup(&[("p1", 10), ("p2", 10)]).await;

    let value = scheduler
        .with_retry(None, |provider, attempt| async move {
            if attempt == 1 {
                Err(AttemptError::Retry(format!("boom on {}", provider.id)))
            } else {
                Ok(provider.id)
            }
        })
        .await
        .unwrap();

    // Second attempt ran on the other provider.
    assert!(ids.contains(&value));
    for id in &ids {
        let row = storage.provider_by_id(*id).await.unwrap().unwrap();
        assert_eq!(row.current_load, 0, "load must balance for provider {id}");
    }

    // Exactly one provider took the failure, the other the success.
    let rows = [
        storage.provider_by_id(ids[0]).await.unwrap().unwrap(),
        storage.provider_by_id(ids[1]).await.unwrap().unwrap(),
    ];
    let failures: i32 = rows.iter().map(|r| r.consecutive_failures).sum();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn with_retry_surfaces_last_error_on_exhaustion() {
    let (storage, scheduler, ids) = setup(&[("p1", 10), ("p2", 10)]).await;

    let result: Result<(), _> = scheduler
        .with_retry(None, |provider, _attempt| async move {
            Err(AttemptError::Retry(format!("err-{}", provider.id)))
        })
        .await;

    match result {
        Err(RetryError::Op(message)) => assert!(message.starts_with("err-")),
        other => panic!("unexpected: {other:?}"),
    }
    for id in &ids {
        let row = storage.provider_by_id(*id).await.unwrap().unwrap();
        assert_eq!(row.current_load, 0);
        assert_eq!(row.consecutive_failures, 1);
    }
}

#[tokio::test]
async fn fatal_attempt_stops_retrying() {
    let (storage, scheduler, ids) = setup(&[("p1", 10), ("p2", 10)]).await;

    let result: Result<(), _> = scheduler
        .with_retry(None, |_provider, _attempt| async move {
            Err(AttemptError::Fatal("nope".to_string()))
        })
        .await;
    assert!(matches!(result, Err(RetryError::Op(_))));

    // Only one provider was touched.
    let failures: i32 = [
        storage.provider_by_id(ids[0]).await.unwrap().unwrap(),
        storage.provider_by_id(ids[1]).await.unwrap().unwrap(),
    ]
    .iter()
    .map(|r| r.consecutive_failures)
    .sum();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn recovery_tick_reactivates_cooled_provider() {
    let (storage, scheduler, ids) = setup(&[("p1", 10)]).await;

    for _ in 0..5 {
        scheduler.record_failure(ids[0]).await;
    }
    let row = storage.provider_by_id(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, ProviderStatus::Cooling);
    assert!(matches!(
        scheduler.acquire(None, &[]).await,
        Err(SchedulerError::NoAvailableProvider)
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let recovered = scheduler.run_recovery().await.unwrap();
    assert_eq!(recovered, 1);

    let row = storage.provider_by_id(ids[0]).await.unwrap().unwrap();
    assert_eq!(row.status, ProviderStatus::Active);
    assert_eq!(row.health_score, 50);
    assert!(scheduler.acquire(None, &[]).await.is_ok());
}
