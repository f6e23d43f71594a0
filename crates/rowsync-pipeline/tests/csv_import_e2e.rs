//! End-to-end import of a CSV file on disk

mod common;

use anyhow::Result;
use common::Company;
use rowsync_common::FileRef;
use rowsync_pipeline::parser::{FieldRule, ValidationRules};
use rowsync_pipeline::{
    ColumnMapParser, CsvSource, EntityRegistry, ImportFile, MemoryStore, Pipeline, PipelineConfig, RowParser,
    RowSource,
};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

struct CompaniesCsv {
    source: CsvSource,
}

impl ImportFile for CompaniesCsv {
    fn file_ref(&self) -> FileRef {
        FileRef::new("companies_csv", 1)
    }

    fn source(&self) -> &dyn RowSource {
        &self.source
    }

    fn row_parser(&self) -> Arc<dyn RowParser> {
        Arc::new(
            ColumnMapParser::<Company>::new()
                .column("Company name", "name")
                .with_rules(ValidationRules::new().field("Company name", vec![FieldRule::Required])),
        )
    }
}

fn write_csv(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[tokio::test]
async fn test_csv_import_end_to_end() -> Result<()> {
    let csv = write_csv("Company name,City\nAcme,Berlin\n,Nowhere\n\"Globex, Inc\",Paris\nAcme,Munich\n")?;
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        Arc::clone(&store),
        EntityRegistry::new().with::<Company>(),
        PipelineConfig::default(),
    );
    let file = CompaniesCsv {
        source: CsvSource::new(csv.path()),
    };

    let (collected, parsed) = pipeline.parse(&file).await?;
    assert_eq!(collected.inserted, 5);
    assert_eq!(parsed.entities, 3);
    assert_eq!(parsed.validation_failures, 1);

    let stats = pipeline.apply(&file.file_ref()).await?;
    assert_eq!(stats.created, 2);
    assert_eq!(stats.collided, 1);

    let names: Vec<String> = store
        .table_rows("companies")
        .await
        .iter()
        .filter_map(|(_, values)| values["name"].as_str().map(str::to_string))
        .collect();
    assert_eq!(names, vec!["Acme".to_string(), "Globex, Inc".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_csv_edit_updates_changed_lines_only() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        Arc::clone(&store),
        EntityRegistry::new().with::<Company>(),
        PipelineConfig::default(),
    );

    let original = write_csv("Company name\nAcme\nGlobex\n")?;
    pipeline
        .collect(&CompaniesCsv {
            source: CsvSource::new(original.path()),
        })
        .await?;

    let edited = write_csv("Company name\nAcme\nInitech\nGlobex\n")?;
    let stats = pipeline
        .collect(&CompaniesCsv {
            source: CsvSource::new(edited.path()),
        })
        .await?;

    assert_eq!(stats.unchanged, 2);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.inserted, 1);
    Ok(())
}
