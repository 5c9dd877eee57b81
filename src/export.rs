use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::Event;
use crate::utils;

pub const JSON_FILE: &str = "events.json";
pub const CSV_FILE: &str = "events.csv";
const CSV_HEADER: &str = "title,start_time,end_time,location,score,matched_terms,url";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("could not create output directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("could not write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("could not serialize events: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not read {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportPaths {
    pub json: PathBuf,
    pub csv: PathBuf,
}

/// Writes `events.json` and `events.csv` into `out_dir`.
///
/// Both files are fully written to temporaries in the same directory before
/// either is renamed over its destination. If the second rename fails the
/// previous `events.json` is put back, so a failed export leaves the pair as
/// it was.
pub fn export_events(events: &[Event], out_dir: &Path) -> Result<ExportPaths, ExportError> {
    utils::ensure_dir(out_dir).map_err(|source| ExportError::CreateDir {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let paths = ExportPaths {
        json: out_dir.join(JSON_FILE),
        csv: out_dir.join(CSV_FILE),
    };

    let json = serde_json::to_string_pretty(events)?;
    let json_tmp = write_temp(out_dir, json.as_bytes())?;
    let csv_tmp = write_temp(out_dir, render_csv(events).as_bytes())?;

    let previous_json = read_existing(&paths.json)?;
    persist(json_tmp, &paths.json)?;
    if let Err(err) = persist(csv_tmp, &paths.csv) {
        restore(out_dir, &paths.json, previous_json.as_deref());
        return Err(err);
    }

    info!(
        count = events.len(),
        json = %paths.json.display(),
        csv = %paths.csv.display(),
        "exported events"
    );
    Ok(paths)
}

pub fn read_events_json(path: &Path) -> Result<Vec<Event>, ExportError> {
    let contents = fs::read_to_string(path).map_err(|err| ExportError::Read {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|err| ExportError::Read {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, ExportError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ExportError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}

/// Puts `path` back to `previous`, removing it when there was nothing before.
fn restore(dir: &Path, path: &Path, previous: Option<&[u8]>) {
    let restored = match previous {
        Some(bytes) => write_temp(dir, bytes).and_then(|file| persist(file, path)),
        None => fs::remove_file(path).map_err(|source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        }),
    };
    if let Err(err) = restored {
        warn!(path = %path.display(), error = %err, "could not restore previous export");
    }
}

fn write_temp(dir: &Path, contents: &[u8]) -> Result<NamedTempFile, ExportError> {
    let failed = |source| ExportError::Write {
        path: dir.to_path_buf(),
        source,
    };
    let mut file = NamedTempFile::new_in(dir).map_err(failed)?;
    file.write_all(contents).map_err(failed)?;
    file.as_file().sync_all().map_err(failed)?;
    Ok(file)
}

fn persist(file: NamedTempFile, path: &Path) -> Result<(), ExportError> {
    file.persist(path)
        .map(|_| ())
        .map_err(|err| ExportError::Write {
            path: path.to_path_buf(),
            source: err.error,
        })
}

pub fn render_csv(events: &[Event]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for event in events {
        let end = event
            .end_time
            .map(|end| end.to_rfc3339())
            .unwrap_or_default();
        let fields = [
            csv_field(&event.title),
            csv_field(&event.start_time.to_rfc3339()),
            csv_field(&end),
            csv_field(event.location()),
            format!("{:.4}", event.relevance_score),
            csv_field(&event.matched_terms.join("; ")),
            csv_field(&event.source_url),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

/// RFC 4180 quoting: fields with commas, quotes or line breaks are wrapped in
/// quotes with inner quotes doubled.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn sample_events() -> Vec<Event> {
        let pacific = FixedOffset::west_opt(7 * 3600).unwrap();
        vec![
            Event {
                source_url: "https://lu.ma/llm-obs-meetup".to_string(),
                title: "LLM Observability Meetup".to_string(),
                start_time: pacific.with_ymd_and_hms(2026, 10, 24, 18, 0, 0).unwrap(),
                end_time: Some(pacific.with_ymd_and_hms(2026, 10, 24, 21, 0, 0).unwrap()),
                location_text: Some("The Midway, San Francisco, CA".to_string()),
                region_tag: Some("sf_bay".to_string()),
                description: "Tracing, evals and \"agent reliability\".".to_string(),
                tags: vec!["AI".to_string(), "LLMOps".to_string()],
                relevance_score: 0.77687,
                matched_terms: vec!["observability".to_string(), "agent reliability".to_string()],
                rationale: "Matches observability (observability).".to_string(),
            },
            Event {
                source_url: "https://lu.ma/agents-hack-26".to_string(),
                title: "Agents \"Hack\" Night".to_string(),
                start_time: pacific.with_ymd_and_hms(2026, 10, 30, 0, 0, 0).unwrap(),
                end_time: None,
                location_text: None,
                region_tag: None,
                description: String::new(),
                tags: Vec::new(),
                relevance_score: 0.0,
                matched_terms: Vec::new(),
                rationale: "No topic keywords matched.".to_string(),
            },
        ]
    }

    #[test]
    fn export_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let events = sample_events();
        let paths = export_events(&events, dir.path()).expect("export");

        assert_eq!(paths.json, dir.path().join(JSON_FILE));
        assert_eq!(read_events_json(&paths.json).expect("read back"), events);
    }

    #[test]
    fn csv_quotes_and_formats_fields() {
        let csv = render_csv(&sample_events());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(
            lines[1],
            "LLM Observability Meetup,2026-10-24T18:00:00-07:00,2026-10-24T21:00:00-07:00,\
             \"The Midway, San Francisco, CA\",0.7769,observability; agent reliability,\
             https://lu.ma/llm-obs-meetup"
        );
        assert_eq!(
            lines[2],
            "\"Agents \"\"Hack\"\" Night\",2026-10-30T00:00:00-07:00,,,0.0000,,https://lu.ma/agents-hack-26"
        );
    }

    #[test]
    fn leaves_no_temporaries_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        export_events(&sample_events(), dir.path()).unwrap();
        export_events(&[], dir.path()).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![CSV_FILE.to_string(), JSON_FILE.to_string()]);

        assert!(read_events_json(&dir.path().join(JSON_FILE)).unwrap().is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join(CSV_FILE)).unwrap(),
            format!("{CSV_HEADER}\n")
        );
    }

    fn blocked_csv(dir: &Path) {
        let csv = dir.join(CSV_FILE);
        fs::create_dir(&csv).unwrap();
        fs::write(csv.join("keep"), "x").unwrap();
    }

    #[test]
    fn failed_csv_rename_keeps_previous_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(JSON_FILE), "OLD").unwrap();
        blocked_csv(dir.path());

        let err = export_events(&sample_events(), dir.path()).unwrap_err();
        assert!(matches!(err, ExportError::Write { .. }));
        assert_eq!(fs::read_to_string(dir.path().join(JSON_FILE)).unwrap(), "OLD");

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![CSV_FILE.to_string(), JSON_FILE.to_string()]);
    }

    #[test]
    fn failed_csv_rename_removes_new_json() {
        let dir = tempfile::tempdir().unwrap();
        blocked_csv(dir.path());

        assert!(export_events(&sample_events(), dir.path()).is_err());
        assert!(!dir.path().join(JSON_FILE).exists());
    }

    #[test]
    fn creates_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out").join("today");
        let paths = export_events(&sample_events(), &nested).unwrap();
        assert!(paths.csv.exists());
    }
}
