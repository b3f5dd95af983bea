use ndarray::ArrayView1;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Failed to write submission file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode submission rows: {0}")]
    Csv(#[from] csv::Error),
    #[error("Submission has {ids} image ids but {labels} labels.")]
    LengthMismatch { ids: usize, labels: usize },
    #[error("Label for image '{id}' is not a probability in [0, 1] ({value}).")]
    InvalidLabel { id: String, value: f64 },
}

#[derive(Serialize)]
struct SubmissionRow<'a> {
    #[serde(rename = "Id")]
    id: &'a str,
    #[serde(rename = "Label")]
    label: f64,
}

/// Writes an `Id,Label` submission file.
pub fn write_submission(
    path: &Path,
    ids: &[String],
    labels: ArrayView1<f64>,
) -> Result<(), SubmissionError> {
    if ids.len() != labels.len() {
        return Err(SubmissionError::LengthMismatch {
            ids: ids.len(),
            labels: labels.len(),
        });
    }
    if let Some((id, &value)) = ids
        .iter()
        .zip(labels.iter())
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        return Err(SubmissionError::InvalidLabel {
            id: id.clone(),
            value,
        });
    }

    let mut writer = csv::Writer::from_path(path)?;
    for (id, &label) in ids.iter().zip(labels.iter()) {
        writer.serialize(SubmissionRow { id, label })?;
    }
    writer.flush()?;
    log::info!("Saved submission with {} rows to '{}'", ids.len(), path.display());
    Ok(())
}

/// `{model}_{mean_cv:.4}.csv`, e.g. `logreg_0.9312.csv`.
pub fn default_submission_name(model: &str, mean_cv: f64) -> String {
    format!("{model}_{mean_cv:.4}.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn writes_id_label_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("submission.csv");
        let ids = vec!["0001.jpg".to_string(), "0002.jpg".to_string()];
        write_submission(&path, &ids, array![0.25, 1.0].view()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Id,Label\n0001.jpg,0.25\n0002.jpg,1.0\n");
    }

    #[test]
    fn rejects_mismatched_lengths_and_bad_labels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("submission.csv");
        let ids = vec!["a".to_string()];
        assert!(matches!(
            write_submission(&path, &ids, array![0.1, 0.2].view()),
            Err(SubmissionError::LengthMismatch { ids: 1, labels: 2 })
        ));
        assert!(matches!(
            write_submission(&path, &ids, array![f64::NAN].view()),
            Err(SubmissionError::InvalidLabel { .. })
        ));
    }

    #[test]
    fn default_name_rounds_the_score() {
        assert_eq!(default_submission_name("logreg", 0.931249), "logreg_0.9312.csv");
    }
}
