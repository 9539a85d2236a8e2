use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::AppError;
use crate::fixtures::ClusterHarness;
use crate::models::{ClusterConfig, IdealState, RebalanceMode};
use crate::statemodel::MASTER_SLAVE;
use crate::verifier::Verifier;

async fn cluster_with_resource() -> Result<ClusterHarness> {
    let mut harness = ClusterHarness::new(ClusterConfig::new("verify")).await?;
    for idx in 0..3 {
        harness.start_node(&format!("node-{}", idx)).await?;
    }
    harness.add_resource(&IdealState::new("db", 4, 2, MASTER_SLAVE, RebalanceMode::FullAuto)).await?;
    Ok(harness)
}

#[tokio::test]
async fn one_shot_reports_current_convergence() -> Result<()> {
    let harness = cluster_with_resource().await?;
    let verifier = harness.verifier(Verifier::OneShot);

    let converged = verifier.verify(&[], Duration::from_millis(10)).await?;
    assert!(!converged, "expected a fresh resource to not be converged");
    let divergences = verifier.divergences(&["db".to_string()]).await?;
    assert_eq!(divergences.len(), 4, "expected every partition to diverge, got {:?}", divergences);

    harness.rebalance_until_stable().await?;

    let converged = verifier.verify(&["db".to_string()], Duration::from_millis(10)).await?;
    assert!(converged, "expected the resource to converge after rebalancing");
    Ok(())
}

#[tokio::test]
async fn polling_times_out_without_progress() -> Result<()> {
    let harness = cluster_with_resource().await?;
    let verifier = harness.verifier(Verifier::Polling {
        interval: Duration::from_millis(10),
    });

    let err = verifier
        .verify(&[], Duration::from_millis(100))
        .await
        .err()
        .context("expected the verifier to time out")?;
    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::ConvergenceTimeout { waited_ms: 100 }), "expected ConvergenceTimeout, got {:?}", app_err);

    let converged = verifier.verify_converged(&[], 50).await?;
    assert!(!converged, "expected verify converged to map the timeout to false");
    Ok(())
}

#[tokio::test]
async fn polling_wakes_on_store_changes() -> Result<()> {
    let harness = cluster_with_resource().await?;
    let verifier = harness.verifier(Verifier::Polling {
        interval: Duration::from_secs(60),
    });

    let handle = tokio::spawn(async move { verifier.verify_converged(&[], 5_000).await });
    harness.rebalance_until_stable().await?;

    let converged = handle.await.context("error joining verifier task")??;
    assert!(converged, "expected the verifier to observe convergence through store events");
    Ok(())
}

#[tokio::test]
async fn unknown_resource_never_converges() -> Result<()> {
    let harness = cluster_with_resource().await?;
    harness.rebalance_until_stable().await?;
    let verifier = harness.verifier(Verifier::OneShot);

    let converged = verifier.verify(&["missing".to_string()], Duration::from_millis(10)).await?;

    assert!(!converged, "expected an unknown resource to be reported as not converged");
    Ok(())
}
