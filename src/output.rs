use std::fs::File;
use std::path::Path;

use log::info;

use crate::error::PKResult;
use crate::monitoring::MonitoringResult;
use crate::patient::Patient;
use crate::protocol::{ProtocolResult, ScheduleRow};

/// Writes a monitoring run's concentration-time CSV and a JSON summary.
pub fn save_monitoring_results<P: AsRef<Path>>(
    result: &MonitoringResult,
    patient: &Patient,
    output_dir: P,
) -> PKResult<()> {
    let output_path = output_dir.as_ref();
    std::fs::create_dir_all(output_path)?;

    let csv_file = File::create(output_path.join("concentrations.csv"))?;
    crate::monitoring::write_csv(csv_file, patient, &result.time_series)?;

    let json_file = File::create(output_path.join("monitoring_summary.json"))?;
    serde_json::to_writer_pretty(json_file, result)?;

    info!("monitoring results saved to {:?}", output_path);
    Ok(())
}

/// Writes a protocol run's schedule, full time series, and performance
/// metrics.
pub fn save_protocol_results<P: AsRef<Path>>(result: &ProtocolResult, output_dir: P) -> PKResult<()> {
    let output_path = output_dir.as_ref();
    std::fs::create_dir_all(output_path)?;

    save_schedule(&result.schedule, output_path.join("schedule.csv"))?;

    let series_file = File::create(output_path.join("time_series.json"))?;
    serde_json::to_writer_pretty(series_file, &result.time_series)?;

    let performance_file = File::create(output_path.join("performance.json"))?;
    serde_json::to_writer_pretty(performance_file, &result.performance)?;

    info!("protocol results saved to {:?}", output_path);
    Ok(())
}

fn save_schedule<P: AsRef<Path>>(schedule: &[ScheduleRow], path: P) -> PKResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["T_MIN", "EVENT", "DETAIL"])?;

    for row in schedule {
        let (event, detail) = match row {
            ScheduleRow::Bolus { dose_mg, .. } => ("BOLUS".to_string(), format!("{dose_mg:.1} mg")),
            ScheduleRow::StartInfusion { rate_mg_per_hr, .. } => {
                ("START_INFUSION".to_string(), format!("{rate_mg_per_hr:.1} mg/hr"))
            }
            ScheduleRow::StepDown {
                old_rate_mg_per_hr,
                new_rate_mg_per_hr,
                ce_ug_per_ml,
                ..
            } => (
                "STEP_DOWN".to_string(),
                format!("{old_rate_mg_per_hr:.1} -> {new_rate_mg_per_hr:.1} mg/hr at Ce={ce_ug_per_ml:.3}"),
            ),
            ScheduleRow::MaintenancePoint {
                target_ce,
                observed_ce,
                within_tolerance,
                ..
            } => (
                "MAINTENANCE_POINT".to_string(),
                format!("target={target_ce:.2}, observed={observed_ce:.3}, within_tolerance={within_tolerance}"),
            ),
        };
        let t_min = match row {
            ScheduleRow::Bolus { t_min, .. }
            | ScheduleRow::StartInfusion { t_min, .. }
            | ScheduleRow::StepDown { t_min, .. }
            | ScheduleRow::MaintenancePoint { t_min, .. } => *t_min,
        };
        writer.write_record([t_min.to_string(), event, detail])?;
    }

    writer.flush()?;
    Ok(())
}

/// A short markdown report summarizing a protocol run.
pub fn generate_protocol_report<P: AsRef<Path>>(result: &ProtocolResult, output_dir: P) -> PKResult<()> {
    let output_path = output_dir.as_ref();
    let report_path = output_path.join("protocol_report.md");
    let perf = &result.performance;

    let report_content = format!(
        r#"# Step-Down Infusion Protocol Report

## Optimal Settings
- **Initial continuous rate**: {:.1} mg/hr
- **Step-downs applied**: {}

## Performance
- Maintenance score: {:.1}
- Stability index: {:.1}
- Convergence time: {}
- Overshoot: {:.1}%
- Time in target: {:.1}%
- Overall score: {:.1}

## Files Generated
- `schedule.csv`: bolus, infusion start, step-downs, and maintenance-point checkpoints
- `time_series.json`: full plasma/effect-site/BIS trajectory
- `performance.json`: the metrics above in machine-readable form
"#,
        result.optimal_initial_rate_mg_per_hr,
        result.adjustments.len(),
        perf.maintenance_score,
        perf.stability_index,
        perf.convergence_time_min
            .map(|t| format!("{t:.1} min"))
            .unwrap_or_else(|| "never".to_string()),
        perf.overshoot_percent,
        perf.time_in_target * 100.0,
        perf.overall_score,
    );

    std::fs::write(report_path, report_content)?;
    Ok(())
}
