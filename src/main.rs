use std::sync::Arc;

use dotenvy::dotenv;
use remit835::{
    domain::models::BucketStatus,
    infrastructure::{config::Config, db, state::AppState},
    jobs,
    services::{
        bucket_manager::BucketManager, check_payment::CheckPaymentService,
        check_reservation::CheckReservationService, delivery::DeliveryEngine,
        edi_generator::EdiGenerator, template_expander::TemplateExpander,
        threshold_monitor::ThresholdMonitor,
    },
    telemetry,
};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    telemetry::init();

    let config = Arc::new(Config::from_env()?);
    let pool = db::connect(&config.database).await?;
    db::run_migrations(&pool).await?;
    info!("database migrations completed successfully");

    let sftp_client = remit835::infrastructure::state::build_sftp_client();
    let state = Arc::new(AppState::new(Arc::clone(&config), pool.clone(), sftp_client)?);

    let check_reservation = Arc::new(
        CheckReservationService::new(pool.clone(), config.check_reservation.low_watermark)
            .with_separate_transaction_mode(config.check_reservation.use_separate_transaction),
    );
    let check_payment = Arc::new(CheckPaymentService::new(
        pool.clone(),
        check_reservation,
        config.check_payment.require_acknowledgement_before_issue,
        config.check_payment.void_time_limit_hours,
    ));
    let bucket_manager = Arc::new(BucketManager::new(
        pool.clone(),
        Arc::clone(&state.event_bus),
        Arc::clone(&check_payment),
        config.check_payment.require_acknowledgement_before_edi,
    ));
    check_payment.set_transitions(bucket_manager.clone());
    let template_expander = Arc::new(TemplateExpander::new(pool.clone()));
    let edi_generator = Arc::new(EdiGenerator::new(
        pool.clone(),
        Arc::clone(&state.x12_writer),
        Arc::clone(&bucket_manager),
        template_expander,
    ));
    let delivery_engine = Arc::new(DeliveryEngine::new(
        pool.clone(),
        Arc::clone(&state.sftp_client),
        Arc::clone(&state.encryption),
        config.delivery.clone(),
    ));
    let threshold_monitor = Arc::new(ThresholdMonitor::new(
        pool.clone(),
        Arc::clone(&bucket_manager),
        config.threshold_monitor.clone(),
    ));

    let _generation_handle = spawn_generation_subscriber(Arc::clone(&state), edi_generator);
    let _threshold_handle = jobs::spawn_threshold_monitor(Arc::clone(&threshold_monitor));
    let _time_based_sweep_handle = jobs::spawn_threshold_time_based_sweep(Arc::clone(&threshold_monitor));
    let _cleanup_sweep_handle = jobs::spawn_threshold_cleanup_sweep(Arc::clone(&threshold_monitor));
    let _stale_approval_handle = jobs::spawn_stale_approval_inspector(threshold_monitor);
    let _delivery_handle = jobs::spawn_delivery_sweeper(delivery_engine, config.delivery.sweep_interval_seconds);

    info!("remit835 engine started");
    shutdown_signal().await;
    info!("shutdown signal received, exiting");

    Ok(())
}

/// Listens for `Accumulating -> Generating` transitions on the event bus and
/// hands each one to the EDI Generator. A lagging subscriber only misses
/// events already covered by the next `ThresholdMonitor` sweep, so a dropped
/// notification is logged and not otherwise treated as fatal.
fn spawn_generation_subscriber(state: Arc<AppState>, edi_generator: Arc<EdiGenerator>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut receiver = state.event_bus.subscribe();
        loop {
            match receiver.recv().await {
                Ok(event) if event.new_status == BucketStatus::Generating => {
                    let generator = Arc::clone(&edi_generator);
                    let bucket_id = event.bucket_id;
                    tokio::spawn(async move {
                        if let Err(err) = generator.generate_for_bucket(bucket_id).await {
                            error!(%bucket_id, error = %err, "835 generation failed");
                        }
                    });
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "generation subscriber lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
