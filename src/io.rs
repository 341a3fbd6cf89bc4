use std::io::Write;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{de::DeserializeOwned, Serialize};
use time::OffsetDateTime;

use crate::error::IoError;
use crate::queue::{UploadDescriptor, UploadQueue};
use crate::types::CalibrationOutcome;

const PARAM_SUFFIX: &str = "-camera_para.json";
const UNKNOWN_FOCAL: &str = "0.000";

/// Serializes an object to a JSON file.
pub fn object_to_json<T: Serialize>(output_path: &Path, object: &T) -> Result<(), IoError> {
    let j = serde_json::to_string_pretty(object)?;
    let mut file = std::fs::File::create(output_path)?;
    file.write_all(j.as_bytes())?;
    Ok(())
}

/// Deserializes an object from a JSON file.
pub fn object_from_json<T: DeserializeOwned>(file_path: &Path) -> Result<T, IoError> {
    let contents = std::fs::read_to_string(file_path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Writes a calibration report to a text file.
pub fn write_report(output_path: &Path, outcome: &CalibrationOutcome) -> Result<(), IoError> {
    let p = &outcome.params;
    let mut s = String::new();
    s += format!("Calibrated from {} views\n\n", outcome.view_count).as_str();
    s += format!("image size: {}x{}\n", p.width, p.height).as_str();
    s += format!("focal length: fx {:.3} fy {:.3}\n", p.fx, p.fy).as_str();
    s += format!("principal point: cx {:.3} cy {:.3}\n\n", p.cx, p.cy).as_str();
    s += format!("    minimum reprojection error: {:.5} px\n", outcome.err_min).as_str();
    s += format!("    average reprojection error: {:.5} px\n", outcome.err_avg).as_str();
    s += format!("    maximum reprojection error: {:.5} px\n", outcome.err_max).as_str();
    let mut file = std::fs::File::create(output_path)?;
    file.write_all(s.as_bytes())?;
    Ok(())
}

/// Where and under which identity a finished calibration is kept.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Directory receiving a named copy of the parameters.
    pub save_dir: Option<PathBuf>,
    pub device_id: Option<String>,
    /// Focal distance preset of the camera, in metres, when known.
    pub focal_length: Option<String>,
    /// Extra `name,value` fields for the upload index.
    pub extra_fields: UploadDescriptor,
}

/// Paths written by `save_outcome`.
#[derive(Debug, Clone)]
pub struct SavedOutcome {
    pub param_path: PathBuf,
    pub copy_path: Option<PathBuf>,
    pub upload_path: PathBuf,
}

/// UTC timestamp in the `1999-12-31 23:59:59 +0000` form the upload index
/// uses.
pub fn utc_timestamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} +0000",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn copy_file_name(outcome: &CalibrationOutcome, options: &SaveOptions) -> String {
    let device: String = options
        .device_id
        .as_deref()
        .unwrap_or("")
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let mut name = format!(
        "camera_para-{}-0-{}x{}",
        device, outcome.params.width, outcome.params.height
    );
    // an unknown focal distance is recorded as 0.000 and left out of the name
    if let Some(focal) = options.focal_length.as_deref().filter(|f| *f != UNKNOWN_FOCAL) {
        name += format!("-{}", focal).as_str();
    }
    name + ".json"
}

/// Upload index fields describing `outcome`.
pub fn upload_descriptor(
    outcome: &CalibrationOutcome,
    param_path: &Path,
    now: OffsetDateTime,
    options: &SaveOptions,
) -> UploadDescriptor {
    let mut fields: UploadDescriptor = vec![
        ("version".to_string(), "1".to_string()),
        ("file".to_string(), param_path.display().to_string()),
        ("timestamp".to_string(), utc_timestamp(now)),
        ("os_name".to_string(), std::env::consts::OS.to_string()),
        ("os_arch".to_string(), std::env::consts::ARCH.to_string()),
        (
            "device_id".to_string(),
            options.device_id.clone().unwrap_or_default(),
        ),
        (
            "focal_length".to_string(),
            options
                .focal_length
                .clone()
                .unwrap_or_else(|| UNKNOWN_FOCAL.to_string()),
        ),
        ("camera_index".to_string(), "0".to_string()),
        ("camera_width".to_string(), outcome.params.width.to_string()),
        ("camera_height".to_string(), outcome.params.height.to_string()),
        ("err_min".to_string(), format!("{:.6}", outcome.err_min)),
        ("err_avg".to_string(), format!("{:.6}", outcome.err_avg)),
        ("err_max".to_string(), format!("{:.6}", outcome.err_max)),
    ];
    fields.extend(options.extra_fields.iter().cloned());
    fields
}

/// Persists `outcome` into the upload queue and, optionally, a named copy.
///
/// The parameters land in `<queue>/<id>-camera_para.json`, where `id` is the
/// UTC `HHMMSS` of the save, then an index file is queued for upload.
pub fn save_outcome(
    outcome: &CalibrationOutcome,
    queue: &UploadQueue,
    options: &SaveOptions,
) -> Result<SavedOutcome, IoError> {
    let now = OffsetDateTime::now_utc();
    let base_id = now.hour() as u32 * 10000 + now.minute() as u32 * 100 + now.second() as u32;
    let id = queue.free_id(base_id, PARAM_SUFFIX);
    let param_path = queue.dir().join(format!("{}{}", id, PARAM_SUFFIX));
    object_to_json(&param_path, outcome)?;

    let copy_path = match &options.save_dir {
        Some(dir) => {
            let path = dir.join(copy_file_name(outcome, options));
            match std::fs::copy(&param_path, &path) {
                Ok(_) => {
                    info!("saved calibration to '{}'", path.display());
                    Some(path)
                }
                Err(e) => {
                    error!("error saving calibration to '{}': {}", path.display(), e);
                    None
                }
            }
        }
        None => None,
    };

    let descriptor = upload_descriptor(outcome, &param_path, now, options);
    let upload_path = queue.enqueue(&id, &descriptor)?;
    Ok(SavedOutcome {
        param_path,
        copy_path,
        upload_path,
    })
}
