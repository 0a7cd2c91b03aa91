use deskbike::{Bike, BikeEvent, Result, WorkoutSummary};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚲 Deskbike Workout Monitor Example");
    info!("Searching for the bike...");

    let bike = Bike::new();
    let mut events = bike.subscribe();

    if let Err(e) = bike.wait_for_connection().await {
        error!("❌ Failed to connect to bike: {}", e);
        return Err(e);
    }
    info!("✅ Connected");

    bike.start_workout().await?;
    info!("Press Ctrl+C to stop the workout");

    let mut summary = WorkoutSummary::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping workout...");
                break;
            }
            event = events.recv() => {
                let Ok(event) = event else {
                    warn!("Event stream lagged or closed");
                    continue;
                };

                match event {
                    BikeEvent::WorkoutStarted => info!("🏁 Workout started"),
                    BikeEvent::WorkoutUpdate(sample) => {
                        summary.record(&sample);
                        let elapsed = sample.duration_secs;
                        let state = if sample.is_paused() { " (paused)" } else { "" };
                        println!(
                            "{:02}:{:02}  {:6.2} km  {:5.1} km/h  {:3} rpm  level {}{}",
                            elapsed / 60,
                            elapsed % 60,
                            sample.distance_km(),
                            sample.speed_kph(),
                            sample.rpm,
                            sample.speed_level,
                            state
                        );
                    }
                    BikeEvent::Disconnected => warn!("⚠️ Bike disconnected"),
                    BikeEvent::Connected => info!("✅ Bike reconnected"),
                    BikeEvent::Error { error, .. } => error!("❌ Workout failed: {}", error),
                    BikeEvent::WorkoutEnded => {
                        info!("Workout ended by the bike");
                        break;
                    }
                }
            }
        }
    }

    bike.stop_workout().await;
    bike.stop_listening().await;

    if summary.is_empty() {
        info!("No pedalling recorded");
    } else {
        println!("\n📈 Workout Summary");
        println!("Duration:      {:02}:{:02}", summary.duration_secs / 60, summary.duration_secs % 60);
        println!("Distance:      {:.2} km", summary.distance_km);
        println!("Average speed: {:.1} km/h", summary.average_speed_kph);
        println!("Average rpm:   {:.0}", summary.average_rpm);
    }

    Ok(())
}
