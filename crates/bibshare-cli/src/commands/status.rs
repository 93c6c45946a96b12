//! Status command handler

use anyhow::Result;

use bibshare_core::shared::ProcessorResult;
use bibshare_core::{Config, Processor, ProcessorTag, SchemaStatus, Watermark};

use crate::output::{Output, OutputFormat};

struct Report {
    schema: SchemaStatus,
    incompatibility: Option<String>,
    entries: Option<i64>,
    watermark: Option<Watermark>,
}

async fn inspect(processor: &mut Processor) -> ProcessorResult<Report> {
    let schema = processor.schema_status().await?;
    let mut report = Report {
        schema,
        incompatibility: None,
        entries: None,
        watermark: None,
    };
    if report.schema != SchemaStatus::Present {
        return Ok(report);
    }

    if let Err(e) = processor.check_schema_compatibility().await {
        report.incompatibility = Some(e.to_string());
        return Ok(report);
    }
    report.entries = Some(processor.count_entries().await?);
    report.watermark = Some(processor.current_watermark().await?);
    Ok(report)
}

/// Show connection and schema status
///
/// Read-only: never creates the schema.
pub async fn show(config: &Config, output: &Output) -> Result<()> {
    let properties = config.connection_properties();
    let conn = super::connect(config).await?;

    let mut processor = Processor::new(conn, ProcessorTag::generate());
    let report = inspect(&mut processor).await;
    processor.close().await;
    let report = report?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "backend": properties.backend.name(),
                    "target": properties.display_target(),
                    "schema": report.schema,
                    "schema_error": report.incompatibility,
                    "entries": report.entries,
                    "watermark": report.watermark
                })
            );
        }
        OutputFormat::Quiet => {
            let label = match (&report.schema, &report.incompatibility) {
                (SchemaStatus::Present, None) => "ok",
                (SchemaStatus::Present, Some(_)) => "unsupported",
                (SchemaStatus::Absent, _) => "empty",
                (SchemaStatus::Foreign(_), _) => "foreign",
            };
            println!("{}", label);
        }
        OutputFormat::Human => {
            println!("bibshare Status");
            println!("===============");
            println!();
            println!("Shared database:");
            println!("  Backend: {}", properties.backend);
            println!("  Target:  {}", properties.display_target());
            let schema = match &report.schema {
                SchemaStatus::Present => match &report.incompatibility {
                    None => "present".to_string(),
                    Some(e) => format!("unsupported ({})", e),
                },
                SchemaStatus::Absent => "absent (created on first open)".to_string(),
                SchemaStatus::Foreign(missing) => {
                    format!("not a shared database (missing: {})", missing.join(", "))
                }
            };
            println!("  Schema:  {}", schema);

            if let (Some(entries), Some(watermark)) = (report.entries, report.watermark) {
                println!();
                println!("Contents:");
                println!("  Entries:   {}", entries);
                println!("  Watermark: {}", watermark.0);
            }
        }
    }

    Ok(())
}
