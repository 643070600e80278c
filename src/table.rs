use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{ByteRecord, ReaderBuilder, Writer};
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::models::{CanonicalRecord, ClusterPrediction, Recommendation};

/// A table exactly as read from a source: string headers and string cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn read_raw_table(path: &Path) -> Result<RawTable> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    read_raw_from(file)
}

pub fn read_raw_from<R: Read>(reader: R) -> Result<RawTable> {
    let mut chunks = RawChunks::from_reader(reader, usize::MAX)?;
    let headers = chunks.headers().to_vec();
    let mut rows = Vec::new();
    for chunk in chunks.by_ref() {
        rows.extend(chunk?.rows);
    }
    Ok(RawTable { headers, rows })
}

/// Streams a CSV source as consecutive tables of at most `chunk_size` rows,
/// each carrying the shared header row.
pub struct RawChunks<R: Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    chunk_size: usize,
    record: ByteRecord,
    done: bool,
}

impl RawChunks<File> {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_reader(file, chunk_size)
    }
}

impl<R: Read> RawChunks<R> {
    pub fn from_reader(reader: R, chunk_size: usize) -> Result<Self> {
        let mut reader = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = reader
            .byte_headers()?
            .iter()
            .map(|h| decode_cell(h).trim_start_matches('\u{feff}').to_string())
            .collect();
        Ok(Self {
            reader,
            headers,
            chunk_size: chunk_size.max(1),
            record: ByteRecord::new(),
            done: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

/// Invalid UTF-8 becomes U+FFFD so one stray byte only spoils its own cell.
fn decode_cell(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl<R: Read> Iterator for RawChunks<R> {
    type Item = Result<RawTable>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut rows = Vec::new();
        while rows.len() < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => rows.push(self.record.iter().map(decode_cell).collect()),
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
        if rows.is_empty() {
            return None;
        }
        Some(Ok(RawTable {
            headers: self.headers.clone(),
            rows,
        }))
    }
}

#[derive(Debug, Serialize)]
struct ClusteredRow<'a> {
    learner_id: &'a str,
    time_spent: f64,
    avg_score: f64,
    accuracy: f64,
    difficulty_level: i64,
    topic_progress: f64,
    cluster_kmeans: Option<usize>,
    cluster_gmm: Option<usize>,
    gmm_confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RecommendedRow<'a> {
    learner_id: &'a str,
    time_spent: f64,
    avg_score: f64,
    accuracy: f64,
    difficulty_level: i64,
    topic_progress: f64,
    cluster: usize,
    next_difficulty: i64,
    topics: String,
    tips: String,
}

pub fn write_canonical<W: std::io::Write>(
    writer: &mut Writer<W>,
    records: &[CanonicalRecord],
) -> Result<()> {
    for record in records {
        writer.serialize(record)?;
    }
    Ok(())
}

pub fn write_clustered<W: std::io::Write>(
    writer: &mut Writer<W>,
    records: &[CanonicalRecord],
    predictions: &[ClusterPrediction],
) -> Result<()> {
    for (record, prediction) in records.iter().zip(predictions) {
        writer.serialize(ClusteredRow {
            learner_id: &record.learner_id,
            time_spent: record.time_spent,
            avg_score: record.avg_score,
            accuracy: record.accuracy,
            difficulty_level: record.difficulty_level,
            topic_progress: record.topic_progress,
            cluster_kmeans: prediction.hard_cluster,
            cluster_gmm: prediction.soft_cluster,
            gmm_confidence: prediction.confidence,
        })?;
    }
    Ok(())
}

pub fn write_recommended<W: std::io::Write>(
    writer: &mut Writer<W>,
    records: &[CanonicalRecord],
    recommendations: &[Recommendation],
) -> Result<()> {
    for (record, recommendation) in records.iter().zip(recommendations) {
        writer.serialize(RecommendedRow {
            learner_id: &record.learner_id,
            time_spent: record.time_spent,
            avg_score: record.avg_score,
            accuracy: record.accuracy,
            difficulty_level: record.difficulty_level,
            topic_progress: record.topic_progress,
            cluster: recommendation.cluster,
            next_difficulty: recommendation.next_difficulty,
            topics: recommendation.topics.join(","),
            tips: recommendation.tips.join(" | "),
        })?;
    }
    Ok(())
}

pub fn create_writer(path: &Path) -> Result<Writer<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    Writer::from_path(path).map_err(PipelineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_split_rows_and_share_headers() {
        let data = "a,b\n1,2\n3,4\n5,6\n";
        let chunks: Vec<RawTable> = RawChunks::from_reader(data.as_bytes(), 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].rows.len(), 2);
        assert_eq!(chunks[1].rows, vec![vec!["5".to_string(), "6".to_string()]]);
        assert_eq!(chunks[1].headers, vec!["a", "b"]);
    }

    #[test]
    fn invalid_utf8_cells_are_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.csv");
        std::fs::write(&path, b"student_id,score,comment\nA,80,caf\xE9\nB,90,ok\n").unwrap();
        let table = read_raw_table(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0][0], "A");
        assert_eq!(table.rows[0][2], "caf\u{fffd}");
        assert_eq!(table.rows[1], vec!["B", "90", "ok"]);
    }

    #[test]
    fn invalid_utf8_header_does_not_abort() {
        let table = read_raw_from(&b"learner_id,not\xFFe\nL1,x\n"[..]).unwrap();
        assert_eq!(table.headers, vec!["learner_id", "not\u{fffd}e"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn short_rows_are_accepted() {
        let table = read_raw_from("a,b,c\n1,2\n".as_bytes()).unwrap();
        assert_eq!(table.rows[0], vec!["1", "2"]);
    }

    #[test]
    fn header_only_source_is_empty() {
        let table = read_raw_from("learner_id,score\n".as_bytes()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.headers.len(), 2);
    }

    #[test]
    fn clustered_rows_append_cluster_columns() {
        let record = CanonicalRecord {
            learner_id: "L1".to_string(),
            time_spent: 12.5,
            avg_score: 0.5,
            accuracy: 0.75,
            difficulty_level: 1,
            topic_progress: 0.2,
        };
        let prediction = ClusterPrediction {
            cluster: 2,
            hard_cluster: Some(2),
            soft_cluster: None,
            confidence: None,
        };
        let mut writer = Writer::from_writer(Vec::new());
        write_clustered(&mut writer, &[record], &[prediction]).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "learner_id,time_spent,avg_score,accuracy,difficulty_level,topic_progress,cluster_kmeans,cluster_gmm,gmm_confidence"
        );
        assert_eq!(lines.next().unwrap(), "L1,12.5,0.5,0.75,1,0.2,2,,");
    }
}
