//! Inference on a handful of samples and comparison sheets.

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::{GrayImage, Luma};
use log::info;
use serde::{Deserialize, Serialize};

use crate::dataset::{BallDataset, Sample};
use crate::error::{Error, Result};
use crate::model::VariationalAutoEncoder;

const GUTTER: u32 = 2;
const GUTTER_SHADE: u8 = 96;

/// `count` indices spread evenly over `0..n`, truncated like `linspace(..).astype(int)`.
pub fn equidistant_indices(n: usize, count: usize) -> Vec<usize> {
    if n == 0 || count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![0];
    }
    (0..count)
        .map(|i| ((i * (n - 1)) as f64 / (count - 1) as f64) as usize)
        .collect()
}

/// Frames of one sample laid out for a comparison sheet, `[0, 1]` pixels.
pub struct SheetFrames<'a> {
    pub height: usize,
    pub width: usize,
    pub input: &'a [f32],
    pub target: &'a [f32],
    pub prediction: &'a [f32],
}

fn frames(pixels: &[f32], frame_len: usize) -> Vec<&[f32]> {
    pixels.chunks(frame_len).collect()
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Rows: input sequence, ground truth, prediction, absolute deviation.
pub fn render_comparison(sheet: &SheetFrames<'_>) -> GrayImage {
    let frame_len = sheet.height * sheet.width;
    let input = frames(sheet.input, frame_len);
    let target = frames(sheet.target, frame_len);
    let prediction = frames(sheet.prediction, frame_len);
    let deviation: Vec<Vec<f32>> = target
        .iter()
        .zip(prediction.iter())
        .map(|(t, p)| t.iter().zip(p.iter()).map(|(a, b)| (a - b).abs()).collect())
        .collect();
    let deviation: Vec<&[f32]> = deviation.iter().map(|d| d.as_slice()).collect();

    let rows = [input, target, prediction, deviation];
    let num_cols = rows.iter().map(|r| r.len()).max().unwrap_or(0) as u32;
    let (w, h) = (sheet.width as u32, sheet.height as u32);

    let sheet_w = num_cols * w + (num_cols + 1) * GUTTER;
    let sheet_h = rows.len() as u32 * h + (rows.len() as u32 + 1) * GUTTER;
    let mut img = GrayImage::from_pixel(sheet_w, sheet_h, Luma([GUTTER_SHADE]));

    for (r, row) in rows.iter().enumerate() {
        let y0 = GUTTER + r as u32 * (h + GUTTER);
        for (c, frame) in row.iter().enumerate() {
            let x0 = GUTTER + c as u32 * (w + GUTTER);
            for (i, &v) in frame.iter().enumerate() {
                let (x, y) = (i as u32 % w, i as u32 / w);
                img.put_pixel(x0 + x, y0 + y, Luma([to_u8(v)]));
            }
        }
    }

    img
}

pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::TensorData(format!("{:?}", e)))
}

/// Runs the model on one sample and writes its comparison sheet.
pub fn save_sample_sheet<B: Backend>(
    model: &VariationalAutoEncoder<B>,
    dataset: &BallDataset,
    sample: &Sample,
    path: &Path,
    device: &B::Device,
) -> Result<f32> {
    let input = Tensor::<B, 4>::from_data(
        TensorData::new(
            sample.input.clone(),
            [
                1,
                dataset.options.len_inp_sequence,
                dataset.height,
                dataset.width,
            ],
        ),
        device,
    );
    let prediction = tensor_to_vec(model.predict(input))?;

    let mse = prediction
        .iter()
        .zip(sample.target.iter())
        .map(|(p, t)| (p - t) * (p - t))
        .sum::<f32>()
        / prediction.len().max(1) as f32;

    let sheet = SheetFrames {
        height: dataset.height,
        width: dataset.width,
        input: &sample.input,
        target: &sample.target,
        prediction: &prediction,
    };
    render_comparison(&sheet).save(path)?;
    Ok(mse)
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Samples are drawn from the first `batch_size` items of the dataset.
    pub batch_size: usize,
    pub num_show_images: usize,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    pub index: usize,
    pub mse: f32,
    pub sheet: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub samples: Vec<SampleReport>,
    pub mean_mse: f32,
}

pub fn evaluate<B: Backend>(
    model: &VariationalAutoEncoder<B>,
    dataset: &BallDataset,
    options: &EvalOptions,
    device: &B::Device,
) -> Result<EvalSummary> {
    fs::create_dir_all(&options.out_dir)?;

    let pool = options.batch_size.min(dataset.len());
    let indices = equidistant_indices(pool, options.num_show_images);

    let mut samples = Vec::with_capacity(indices.len());
    for (i_sample, &index) in indices.iter().enumerate() {
        info!("Sample {} (dataset index {})", i_sample, index);
        let sample = dataset.get(index)?;
        let sheet = options.out_dir.join(format!("sample{}.png", i_sample));
        let mse = save_sample_sheet(model, dataset, &sample, &sheet, device)?;
        info!("  MSE {:.6}, sheet {:?}", mse, sheet);
        samples.push(SampleReport { index, mse, sheet });
    }

    let mean_mse = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|s| s.mse).sum::<f32>() / samples.len() as f32
    };
    let summary = EvalSummary { samples, mean_mse };

    fs::write(
        options.out_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    info!("Mean MSE over {} samples: {:.6}", summary.samples.len(), mean_mse);

    Ok(summary)
}
