//! PDF Compression Library
//!
//! Core logic for shrinking PDF files while keeping text readable. A
//! Ghostscript pass does the heavy lifting when the binary is installed;
//! otherwise the document is rewritten in-process by re-encoding embedded
//! raster images and recompressing page content streams. The last tier never
//! fails for a readable document: it degrades to a plain copy.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use log::{debug, info, warn};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Candidate Ghostscript binaries, probed in order.
const GS_CANDIDATES: &[&str] = &["gs", "/usr/local/bin/gs", "/opt/homebrew/bin/gs", "/usr/bin/gs"];

/// Wait limit for one Ghostscript run; a hung process is killed after this.
const GS_RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Wait limit for a single `--version` probe.
const GS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Images with either dimension below this are left untouched.
const MIN_IMAGE_DIM: u32 = 150;

/// Images with either dimension above this are left untouched.
const MAX_IMAGE_DIM: u32 = 3000;

/// Scaled dimensions never drop below this.
const MIN_TARGET_DIM: u32 = 200;

/// One compression request. Immutable while the strategy chain runs.
#[derive(Debug)]
struct CompressionRequest {
    input_path: PathBuf,
    output_path: PathBuf,
    quality: u8,
}

/// Final outcome of one compression request.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    /// Whether a strategy ran to completion and produced a usable output file
    pub success: bool,
    /// Human-readable explanation, suitable for direct display
    pub message: String,
    /// Fraction of the input size removed; negative when the output grew
    pub compression_ratio: Option<f64>,
}

impl CompressionOutcome {
    fn completed(message: String, compression_ratio: Option<f64>) -> Self {
        Self {
            success: true,
            message,
            compression_ratio,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            message,
            compression_ratio: None,
        }
    }
}

/// Bookkeeping for one image-recompression pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImagePassStats {
    /// Image XObjects reachable from the page tree
    pub total_images: usize,
    /// Images replaced with a smaller JPEG encoding
    pub replaced_images: usize,
    /// Images left untouched (size window, alpha, color model, or no gain)
    pub skipped_images: usize,
    /// Cumulative stored-byte savings from replacements
    pub bytes_saved: u64,
}

/// Error type for PDF compression operations.
#[derive(Debug, Error)]
pub enum CompressError {
    /// Quality parameter outside the accepted 1-100 range.
    #[error("Quality must be between 1 and 100")]
    InvalidQuality,

    /// Input path does not reference an existing file.
    #[error("Input file does not exist: {}", .0.display())]
    InputNotFound(PathBuf),

    /// Ghostscript could not be spawned.
    #[error("Failed to spawn Ghostscript: {0}")]
    Spawn(#[source] io::Error),

    /// Ghostscript exited with a non-zero status or exceeded its deadline.
    #[error("Ghostscript failed: {0}")]
    GhostscriptFailed(String),

    /// The document could not be parsed.
    #[error("Failed to load PDF: {0}")]
    LoadError(String),

    /// The rewritten document could not be written out.
    #[error("Failed to save PDF: {0}")]
    SaveError(String),

    /// File-size probe on a missing path.
    #[error("File does not exist")]
    FileNotFound,

    /// File-size probe failed to read the path.
    #[error("Error reading file: {0}")]
    Unreadable(#[source] io::Error),

    /// I/O error at a specific path.
    #[error("I/O error at '{}': {}", .path.display(), .source)]
    Io {
        /// The path that triggered the error.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Convenience `Result` alias for this crate's [`CompressError`].
pub type Result<T, E = CompressError> = std::result::Result<T, E>;

/// Map quality (1-100) to a downsampling resolution in the 72-300 dpi band.
fn target_resolution(quality: u8) -> u32 {
    (50.0 + f64::from(quality) / 100.0 * 250.0).clamp(72.0, 300.0) as u32
}

/// Map quality to a Ghostscript `-dPDFSETTINGS` preset.
fn preset_for_quality(quality: u8) -> &'static str {
    if quality < 30 {
        "/screen"
    } else if quality < 60 {
        "/ebook"
    } else {
        "/printer"
    }
}

/// JPEG quality for re-encoded images: a narrower 25-75 band.
fn jpeg_quality_for(quality: u8) -> u8 {
    (f64::from(quality) * 0.8).clamp(25.0, 75.0) as u8
}

/// Uniform scale factor applied to both image axes, never below half size.
fn scale_factor_for(quality: u8) -> f64 {
    (f64::from(quality) / 100.0).clamp(0.5, 1.0)
}

/// Scaled dimensions with the 200-pixel floor applied per axis.
fn target_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let scaled_width = (f64::from(width) * scale) as u32;
    let scaled_height = (f64::from(height) * scale) as u32;
    (
        scaled_width.max(MIN_TARGET_DIM),
        scaled_height.max(MIN_TARGET_DIM),
    )
}

/// Resizing must shrink at least one axis below 90% of the original.
fn should_resize(width: u32, height: u32, target_width: u32, target_height: u32) -> bool {
    f64::from(target_width) < f64::from(width) * 0.9
        || f64::from(target_height) < f64::from(height) * 0.9
}

/// A JPEG candidate replaces the stored bytes only when at least 5% smaller.
fn substitution_accepted(original_len: usize, candidate_len: usize) -> bool {
    (candidate_len as f64) < original_len as f64 * 0.95
}

/// Outcome of a bounded child-process wait.
enum ProcessWait {
    Exited { status: ExitStatus, stderr: String },
    TimedOut,
}

/// Run a command with stderr captured, killing it if the deadline passes.
fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> io::Result<ProcessWait> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain stderr off-thread so a chatty child cannot fill the pipe and hang.
    let stderr_thread = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(handle) = stderr_thread {
                let _ = handle.join();
            }
            return Ok(ProcessWait::TimedOut);
        }
        thread::sleep(PROCESS_POLL_INTERVAL);
    };

    let stderr = stderr_thread
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    Ok(ProcessWait::Exited {
        status,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Searches conventional install locations for a usable Ghostscript binary.
///
/// Each candidate is asked for `--version` with a short deadline; the first
/// one that answers with exit code 0 wins. Returns `None` when Ghostscript is
/// not available. The probe is repeated on every compression call so an
/// install made mid-session is picked up.
pub fn find_ghostscript() -> Option<String> {
    GS_CANDIDATES.iter().find_map(|&candidate| {
        let mut probe = Command::new(candidate);
        probe.arg("--version");
        match run_with_timeout(&mut probe, GS_PROBE_TIMEOUT) {
            Ok(ProcessWait::Exited { status, .. }) if status.success() => {
                Some(candidate.to_owned())
            }
            _ => None,
        }
    })
}

/// Invoke Ghostscript's pdfwrite device with quality-derived parameters.
fn run_ghostscript(gs_bin: &str, input: &Path, output: &Path, quality: u8) -> Result<()> {
    let resolution = target_resolution(quality);
    let preset = preset_for_quality(quality);
    debug!("Ghostscript pass: preset {preset}, {resolution} dpi");

    let mut cmd = Command::new(gs_bin);
    cmd.arg("-sDEVICE=pdfwrite")
        .arg("-dCompatibilityLevel=1.4")
        .arg(format!("-dPDFSETTINGS={preset}"))
        .arg("-dNOPAUSE")
        .arg("-dQUIET")
        .arg("-dBATCH")
        .arg("-dSAFER")
        .arg("-dDownsampleColorImages=true")
        .arg("-dDownsampleGrayImages=true")
        .arg("-dDownsampleMonoImages=true")
        .arg(format!("-dColorImageResolution={resolution}"))
        .arg(format!("-dGrayImageResolution={resolution}"))
        .arg(format!("-dMonoImageResolution={resolution}"))
        .arg("-dCompressPages=true")
        .arg("-dOptimize=true")
        .arg("-dAutoFilterColorImages=false")
        .arg("-dAutoFilterGrayImages=false")
        .arg("-dColorImageFilter=/DCTEncode")
        .arg("-dGrayImageFilter=/DCTEncode")
        .arg(format!("-sOutputFile={}", output.display()))
        .arg(input);

    match run_with_timeout(&mut cmd, GS_RUN_TIMEOUT).map_err(CompressError::Spawn)? {
        ProcessWait::Exited { status, .. } if status.success() => Ok(()),
        ProcessWait::Exited { stderr, .. } => Err(CompressError::GhostscriptFailed(stderr)),
        ProcessWait::TimedOut => Err(CompressError::GhostscriptFailed(format!(
            "no response within {} seconds",
            GS_RUN_TIMEOUT.as_secs()
        ))),
    }
}

/// Ghostscript strategy: write a candidate into scratch space, keep it only
/// on a clean exit. The scratch directory is removed on every return path.
fn ghostscript_pass(gs_bin: &str, request: &CompressionRequest) -> Result<StrategyResult> {
    let scratch = tempfile::tempdir().map_err(|e| CompressError::Io {
        path: std::env::temp_dir(),
        source: e,
    })?;
    let candidate = scratch.path().join("ghostscript.pdf");

    run_ghostscript(gs_bin, &request.input_path, &candidate, request.quality)?;

    fs::copy(&candidate, &request.output_path).map_err(|e| CompressError::Io {
        path: request.output_path.clone(),
        source: e,
    })?;

    let original_size = file_size(&request.input_path)?;
    let compressed_size = file_size(&request.output_path)?;

    if compressed_size < original_size {
        let reduction = (1.0 - compressed_size as f64 / original_size as f64) * 100.0;
        Ok(StrategyResult::success(format!(
            "Successfully compressed! Size reduced by {reduction:.1}% (Ghostscript)"
        )))
    } else {
        // The run completed even though the file grew; surface that as-is.
        let increase = (compressed_size as f64 / original_size as f64 - 1.0) * 100.0;
        Ok(StrategyResult::success(format!(
            "File processed. Size increased by {increase:.1}%. Try lowering quality setting."
        )))
    }
}

fn dict_u32(dict: &Dictionary, key: &[u8]) -> Option<u32> {
    dict.get(key).ok().and_then(|value| match value {
        Object::Integer(n) => Some(*n as u32),
        _ => None,
    })
}

fn dict_name(dict: &Dictionary, key: &[u8]) -> Option<String> {
    dict.get(key).ok().and_then(|value| match value {
        Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
        _ => None,
    })
}

/// First filter name, whether `Filter` is a single name or an array.
fn primary_filter(dict: &Dictionary) -> Option<String> {
    dict.get(b"Filter").ok().and_then(|value| match value {
        Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
        Object::Array(arr) => arr.first().and_then(|first| match first {
            Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
            _ => None,
        }),
        _ => None,
    })
}

/// Resolve a color space entry to its family name.
fn color_space_name(obj: &Object, doc: &Document) -> String {
    match obj {
        Object::Name(name) => String::from_utf8_lossy(name).to_string(),
        Object::Array(arr) => {
            if let Some(Object::Name(name)) = arr.first() {
                String::from_utf8_lossy(name).to_string()
            } else {
                "Unknown".to_string()
            }
        }
        Object::Reference(id) => {
            if let Ok(resolved) = doc.get_object(*id) {
                color_space_name(resolved, doc)
            } else {
                "Unknown".to_string()
            }
        }
        _ => "Unknown".to_string(),
    }
}

/// Resources for a page, checking the parent node for inherited entries.
fn page_resources(doc: &Document, page_dict: &Dictionary) -> Object {
    if let Ok(resources) = page_dict.get(b"Resources") {
        return resources.clone();
    }

    if let Ok(Object::Reference(parent_id)) = page_dict.get(b"Parent") {
        if let Ok(Object::Dictionary(parent_dict)) = doc.get_object(*parent_id) {
            if let Ok(resources) = parent_dict.get(b"Resources") {
                return resources.clone();
            }
        }
    }

    Object::Null
}

/// XObject references listed in a resources dictionary.
fn xobject_ids(doc: &Document, resources: &Object) -> Vec<ObjectId> {
    let mut result = Vec::new();

    let res_dict = match resources {
        Object::Dictionary(d) => Some(d),
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Dictionary(d)) => Some(d),
            _ => None,
        },
        _ => None,
    };

    if let Some(res_dict) = res_dict {
        if let Ok(xobjects) = res_dict.get(b"XObject") {
            let xobj_dict = match xobjects {
                Object::Dictionary(d) => Some(d),
                Object::Reference(id) => match doc.get_object(*id) {
                    Ok(Object::Dictionary(d)) => Some(d),
                    _ => None,
                },
                _ => None,
            };

            if let Some(xobj_dict) = xobj_dict {
                for (_, value) in xobj_dict.iter() {
                    if let Object::Reference(obj_id) = value {
                        result.push(*obj_id);
                    }
                }
            }
        }
    }

    result
}

/// Collect all image XObjects reachable from a page's resources.
fn collect_page_images(
    doc: &Document,
    page_id: ObjectId,
    images: &mut Vec<ObjectId>,
    seen: &mut HashSet<ObjectId>,
) {
    let page_dict = match doc.get_object(page_id) {
        Ok(Object::Dictionary(d)) => d.clone(),
        _ => return,
    };

    let resources = page_resources(doc, &page_dict);
    for xobject_id in xobject_ids(doc, &resources) {
        collect_images_recursive(doc, xobject_id, images, seen);
    }
}

/// Recurse through Form XObjects gathering embedded images exactly once.
fn collect_images_recursive(
    doc: &Document,
    obj_id: ObjectId,
    images: &mut Vec<ObjectId>,
    seen: &mut HashSet<ObjectId>,
) {
    if !seen.insert(obj_id) {
        return;
    }

    let stream = match doc.get_object(obj_id) {
        Ok(Object::Stream(s)) => s,
        _ => return,
    };

    match dict_name(&stream.dict, b"Subtype").as_deref() {
        Some("Image") => images.push(obj_id),
        Some("Form") => {
            if let Ok(resources) = stream.dict.get(b"Resources") {
                for child_id in xobject_ids(doc, resources) {
                    collect_images_recursive(doc, child_id, images, seen);
                }
            }
        }
        _ => {}
    }
}

/// Decode a PDF image stream into raw pixels for the supported color models.
fn decode_image_stream(
    stream: &Stream,
    width: u32,
    height: u32,
    channels: u32,
    bits_per_component: u32,
) -> std::result::Result<DynamicImage, String> {
    let content = &stream.content;

    let decoded_data = match primary_filter(&stream.dict).as_deref() {
        Some("FlateDecode") => {
            let mut decoder = ZlibDecoder::new(&content[..]);
            let mut decoded = Vec::new();
            decoder
                .read_to_end(&mut decoded)
                .map_err(|e| e.to_string())?;
            decoded
        }
        Some("DCTDecode") => {
            let img = image::load_from_memory_with_format(content, ImageFormat::Jpeg)
                .map_err(|e| format!("Failed to decode JPEG image: {}", e))?;
            return Ok(img);
        }
        Some("JPXDecode") => {
            let img = image::load_from_memory(content)
                .map_err(|e| format!("Failed to decode JPEG2000 image: {}", e))?;
            return Ok(img);
        }
        None => content.clone(),
        Some(other) => {
            return Err(format!("Unsupported filter: {}", other));
        }
    };

    if bits_per_component != 8 {
        return Err(format!("Unsupported bit depth: {}", bits_per_component));
    }

    match channels {
        3 => {
            let expected = (width * height * 3) as usize;
            if decoded_data.len() < expected {
                return Err(format!(
                    "RGB data too short: {} bytes (expected {})",
                    decoded_data.len(),
                    expected
                ));
            }
            let img = RgbImage::from_raw(width, height, decoded_data[..expected].to_vec())
                .ok_or("Failed to create RGB image from raw data")?;
            Ok(DynamicImage::ImageRgb8(img))
        }
        1 => {
            let expected = (width * height) as usize;
            if decoded_data.len() < expected {
                return Err(format!(
                    "Grayscale data too short: {} bytes (expected {})",
                    decoded_data.len(),
                    expected
                ));
            }
            let img = GrayImage::from_raw(width, height, decoded_data[..expected].to_vec())
                .ok_or("Failed to create grayscale image from raw data")?;
            Ok(DynamicImage::ImageLuma8(img))
        }
        other => Err(format!("Unsupported channel count: {}", other)),
    }
}

/// Encode an image as baseline JPEG and wrap it in an image XObject stream.
fn encode_as_jpeg_stream(
    img: &DynamicImage,
    quality: u8,
    channels: u32,
) -> std::result::Result<(Stream, usize), String> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality);
    encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::R_4_2_0);
    encoder.set_optimized_huffman_tables(true);

    let (color_space, width, height) = if channels == 1 {
        let gray = img.to_luma8();
        let (width, height) = gray.dimensions();
        encoder
            .encode(
                gray.as_raw(),
                width as u16,
                height as u16,
                jpeg_encoder::ColorType::Luma,
            )
            .map_err(|e| format!("Failed to encode JPEG: {}", e))?;
        (b"DeviceGray".as_slice(), width, height)
    } else {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        encoder
            .encode(
                rgb.as_raw(),
                width as u16,
                height as u16,
                jpeg_encoder::ColorType::Rgb,
            )
            .map_err(|e| format!("Failed to encode JPEG: {}", e))?;
        (b"DeviceRGB".as_slice(), width, height)
    };

    let encoded_len = jpeg_bytes.len();

    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(width as i64));
    dict.set("Height", Object::Integer(height as i64));
    dict.set("ColorSpace", Object::Name(color_space.to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
    dict.set("Length", Object::Integer(encoded_len as i64));

    Ok((Stream::new(dict, jpeg_bytes), encoded_len))
}

/// Re-encode one image object in place. `Ok(Some(saved))` means the object
/// was replaced, `Ok(None)` that a skip rule applied, `Err` a decode or
/// encode fault the caller swallows.
fn rewrite_image(
    doc: &mut Document,
    object_id: ObjectId,
    scale: f64,
    jpeg_quality: u8,
) -> std::result::Result<Option<u64>, String> {
    let stream = match doc.get_object(object_id) {
        Ok(Object::Stream(s)) => s.clone(),
        _ => return Err("not a stream object".to_string()),
    };

    let width = dict_u32(&stream.dict, b"Width").unwrap_or(0);
    let height = dict_u32(&stream.dict, b"Height").unwrap_or(0);

    // Tiny images are usually glyphs or rules; huge ones are scans or
    // special content the resize band would wreck.
    if width < MIN_IMAGE_DIM
        || height < MIN_IMAGE_DIM
        || width > MAX_IMAGE_DIM
        || height > MAX_IMAGE_DIM
    {
        debug!(
            "skipping image {:?}: {}x{} outside working range",
            object_id, width, height
        );
        return Ok(None);
    }

    // Transparency is never touched.
    if stream.dict.get(b"SMask").is_ok() {
        debug!("skipping image {:?}: alpha channel present", object_id);
        return Ok(None);
    }

    let color_space = stream
        .dict
        .get(b"ColorSpace")
        .ok()
        .map(|cs| color_space_name(cs, doc))
        .unwrap_or_else(|| "DeviceRGB".to_string());

    let channels = match color_space.as_str() {
        "DeviceGray" | "Gray" => 1,
        "DeviceRGB" | "RGB" => 3,
        other => {
            debug!("skipping image {:?}: color space {}", object_id, other);
            return Ok(None);
        }
    };

    let bits_per_component = dict_u32(&stream.dict, b"BitsPerComponent").unwrap_or(8);

    let img = decode_image_stream(&stream, width, height, channels, bits_per_component)?;

    let (target_width, target_height) = target_dimensions(width, height, scale);
    let resized = if should_resize(width, height, target_width, target_height) {
        debug!(
            "resizing image {:?} from {}x{} to {}x{}",
            object_id, width, height, target_width, target_height
        );
        img.resize_exact(
            target_width,
            target_height,
            image::imageops::FilterType::Lanczos3,
        )
    } else {
        img
    };

    let (new_stream, encoded_len) = encode_as_jpeg_stream(&resized, jpeg_quality, channels)?;

    let original_len = stream.content.len();
    if !substitution_accepted(original_len, encoded_len) {
        debug!(
            "keeping original {:?}: candidate {} bytes vs {} stored",
            object_id, encoded_len, original_len
        );
        return Ok(None);
    }

    doc.objects.insert(object_id, Object::Stream(new_stream));
    Ok(Some((original_len - encoded_len) as u64))
}

/// Walk every page and re-encode qualifying embedded images. A fault on one
/// image never aborts the pass; the image is simply left as it was.
fn rewrite_document_images(doc: &mut Document, quality: u8) -> ImagePassStats {
    let jpeg_quality = jpeg_quality_for(quality);
    let scale = scale_factor_for(quality);

    let mut targets: Vec<ObjectId> = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    let pages = doc.get_pages();
    for (_, &page_id) in pages.iter() {
        collect_page_images(doc, page_id, &mut targets, &mut seen);
    }
    debug!("found {} embedded images", targets.len());

    let mut stats = ImagePassStats::default();
    for object_id in targets {
        stats.total_images += 1;
        match rewrite_image(doc, object_id, scale, jpeg_quality) {
            Ok(Some(saved)) => {
                stats.replaced_images += 1;
                stats.bytes_saved += saved;
            }
            Ok(None) => stats.skipped_images += 1,
            Err(reason) => {
                debug!("leaving image {:?} untouched: {}", object_id, reason);
                stats.skipped_images += 1;
            }
        }
    }

    stats
}

/// Re-encode embedded raster images at a quality-derived JPEG setting and
/// write the document to `output_path`.
///
/// Images are skipped when they are outside the 150-3000 pixel working
/// range, carry an alpha channel, or use a color model other than plain
/// gray/RGB. A replacement must be at least 5% smaller than the stored
/// stream bytes, otherwise the original object is retained.
pub fn recompress_images(
    input_path: &Path,
    output_path: &Path,
    quality: u8,
) -> Result<ImagePassStats> {
    if quality == 0 || quality > 100 {
        return Err(CompressError::InvalidQuality);
    }

    let mut doc = Document::load(input_path)
        .map_err(|e| CompressError::LoadError(format!("{:?}: {}", input_path, e)))?;

    let stats = rewrite_document_images(&mut doc, quality);

    doc.compress();
    doc.save(output_path)
        .map_err(|e| CompressError::SaveError(format!("{:?}: {}", output_path, e)))?;

    info!(
        "image pass replaced {}/{} images, {} saved",
        stats.replaced_images,
        stats.total_images,
        format_file_size(stats.bytes_saved)
    );

    Ok(stats)
}

/// Image strategy wrapper: succeeds only when the written file shrank.
fn image_rewrite_pass(request: &CompressionRequest) -> Result<StrategyResult> {
    let stats = recompress_images(&request.input_path, &request.output_path, request.quality)?;

    let original_size = file_size(&request.input_path)?;
    let compressed_size = file_size(&request.output_path)?;

    if compressed_size < original_size {
        let reduction = (1.0 - compressed_size as f64 / original_size as f64) * 100.0;
        Ok(StrategyResult::success(format!(
            "Successfully compressed! Size reduced by {reduction:.1}% (Processed {} images, text preserved)",
            stats.replaced_images
        )))
    } else {
        Ok(StrategyResult::failed(format!(
            "image pass produced no reduction ({} of {} images replaced)",
            stats.replaced_images, stats.total_images
        )))
    }
}

/// Collect the content-stream object ids referenced by a `Contents` entry.
fn push_content_stream_ids(
    doc: &Document,
    contents: &Object,
    ids: &mut Vec<ObjectId>,
    seen: &mut HashSet<ObjectId>,
) {
    match contents {
        Object::Reference(id) => {
            if !seen.insert(*id) {
                return;
            }
            match doc.get_object(*id) {
                Ok(Object::Stream(_)) => ids.push(*id),
                Ok(Object::Array(arr)) => {
                    for item in arr {
                        push_content_stream_ids(doc, item, ids, seen);
                    }
                }
                _ => {}
            }
        }
        Object::Array(arr) => {
            for item in arr {
                push_content_stream_ids(doc, item, ids, seen);
            }
        }
        _ => {}
    }
}

/// Recompress one stream with zlib at best level; replace only if smaller.
fn recompress_stream_object(doc: &mut Document, object_id: ObjectId) -> Option<usize> {
    let stream = match doc.get_object(object_id) {
        Ok(Object::Stream(s)) => s.clone(),
        _ => return None,
    };

    let plain = if stream.dict.get(b"Filter").is_ok() {
        stream.decompressed_content().ok()?
    } else {
        stream.content.clone()
    };

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&plain).ok()?;
    let recompressed = encoder.finish().ok()?;

    if recompressed.len() >= stream.content.len() {
        return None;
    }

    let saved = stream.content.len() - recompressed.len();
    let mut dict = stream.dict.clone();
    dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
    dict.remove(b"DecodeParms");
    dict.set("Length", Object::Integer(recompressed.len() as i64));
    doc.objects.insert(object_id, Object::Stream(Stream::new(dict, recompressed)));

    Some(saved)
}

/// Rewrite every page's content streams with best-level flate compression
/// and write the document to `output_path`. Document metadata is untouched.
///
/// Returns the number of streams that actually got smaller.
pub fn recompress_streams(input_path: &Path, output_path: &Path) -> Result<usize> {
    let mut doc = Document::load(input_path)
        .map_err(|e| CompressError::LoadError(format!("{:?}: {}", input_path, e)))?;

    let mut content_ids: Vec<ObjectId> = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    let pages = doc.get_pages();
    for (_, &page_id) in pages.iter() {
        let page_dict = match doc.get_object(page_id) {
            Ok(Object::Dictionary(d)) => d.clone(),
            _ => continue,
        };
        if let Ok(contents) = page_dict.get(b"Contents") {
            push_content_stream_ids(&doc, contents, &mut content_ids, &mut seen);
        }
    }

    let mut rewritten = 0;
    for object_id in content_ids {
        if let Some(saved) = recompress_stream_object(&mut doc, object_id) {
            debug!("recompressed stream {:?}, {} bytes saved", object_id, saved);
            rewritten += 1;
        }
    }

    doc.save(output_path)
        .map_err(|e| CompressError::SaveError(format!("{:?}: {}", output_path, e)))?;

    Ok(rewritten)
}

/// Stream strategy wrapper: reports stream-compression savings, or falls back
/// to a verbatim copy so a structurally valid input always gets an output.
fn stream_rewrite_pass(request: &CompressionRequest) -> Result<StrategyResult> {
    let rewritten = recompress_streams(&request.input_path, &request.output_path)?;

    let original_size = file_size(&request.input_path)?;
    let compressed_size = file_size(&request.output_path)?;

    if compressed_size < original_size {
        let reduction = (1.0 - compressed_size as f64 / original_size as f64) * 100.0;
        info!("stream pass recompressed {} content streams", rewritten);
        Ok(StrategyResult::success(format!(
            "Successfully compressed! Size reduced by {reduction:.1}% (Content stream compression)"
        )))
    } else {
        fs::copy(&request.input_path, &request.output_path).map_err(|e| CompressError::Io {
            path: request.output_path.clone(),
            source: e,
        })?;
        Ok(StrategyResult::success(
            "File processed. No significant compression achieved. Consider using Ghostscript for better results."
                .to_string(),
        ))
    }
}

/// Internal per-strategy verdict, consumed only for fallthrough decisions.
struct StrategyResult {
    succeeded: bool,
    message: String,
}

impl StrategyResult {
    fn success(message: String) -> Self {
        Self {
            succeeded: true,
            message,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            succeeded: false,
            message,
        }
    }
}

/// Compression tiers, evaluated in priority order.
#[derive(Debug)]
enum Strategy {
    Ghostscript { gs_bin: String },
    ImageRewrite,
    StreamRewrite,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Ghostscript { .. } => "Ghostscript",
            Strategy::ImageRewrite => "image recompression",
            Strategy::StreamRewrite => "stream recompression",
        }
    }

    /// Run one tier. Faults inside a tier become that tier's failure; the
    /// stream tier's faults carry the terminal error text for the chain.
    fn attempt(&self, request: &CompressionRequest) -> StrategyResult {
        match self {
            Strategy::Ghostscript { gs_bin } => ghostscript_pass(gs_bin, request)
                .unwrap_or_else(|e| StrategyResult::failed(e.to_string())),
            Strategy::ImageRewrite => image_rewrite_pass(request)
                .unwrap_or_else(|e| StrategyResult::failed(format!("Error compressing PDF: {e}"))),
            Strategy::StreamRewrite => stream_rewrite_pass(request).unwrap_or_else(|e| {
                StrategyResult::failed(format!("Error in alternative compression: {e}"))
            }),
        }
    }
}

fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|e| CompressError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Reduction achieved against `input_size`, measured from the written file.
fn measure_ratio(input_size: u64, output_path: &Path) -> Option<f64> {
    let output_size = fs::metadata(output_path).ok()?.len();
    (input_size > 0).then(|| 1.0 - output_size as f64 / input_size as f64)
}

fn run_strategies(request: &CompressionRequest) -> CompressionOutcome {
    let input_size = match file_size(&request.input_path) {
        Ok(size) => size,
        Err(e) => return CompressionOutcome::failure(format!("Error compressing PDF: {e}")),
    };

    let mut plan: Vec<Strategy> = Vec::new();
    match find_ghostscript() {
        Some(gs_bin) => plan.push(Strategy::Ghostscript { gs_bin }),
        None => info!("Ghostscript not found, using in-process fallback chain"),
    }
    plan.push(Strategy::ImageRewrite);
    plan.push(Strategy::StreamRewrite);

    let mut last_message = String::new();
    for strategy in plan {
        let result = strategy.attempt(request);
        if result.succeeded {
            info!("{} strategy finished: {}", strategy.name(), result.message);
            let ratio = measure_ratio(input_size, &request.output_path);
            return CompressionOutcome::completed(result.message, ratio);
        }
        warn!(
            "{} strategy did not succeed: {}",
            strategy.name(),
            result.message
        );
        last_message = result.message;
    }

    CompressionOutcome::failure(last_message)
}

/// Compress `input_path` into `output_path` at the given quality (1-100).
///
/// Strategies are tried in priority order: a Ghostscript rewrite when the
/// binary is installed, then in-process image re-encoding, then plain
/// content-stream recompression with a verbatim-copy terminal case. The
/// first strategy that completes defines the outcome.
///
/// This call is blocking and synchronous; interactive callers should
/// dispatch it onto a worker thread. It never panics and never returns a
/// Rust error: validation problems and internal faults are folded into a
/// `success = false` outcome with a displayable message.
pub fn compress(input_path: &Path, output_path: &Path, quality: u8) -> CompressionOutcome {
    if quality == 0 || quality > 100 {
        return CompressionOutcome::failure(CompressError::InvalidQuality.to_string());
    }

    if !input_path.exists() {
        return CompressionOutcome::failure(
            CompressError::InputNotFound(input_path.to_path_buf()).to_string(),
        );
    }

    let request = CompressionRequest {
        input_path: input_path.to_path_buf(),
        output_path: output_path.to_path_buf(),
        quality,
    };

    run_strategies(&request)
}

/// Size in bytes of the file at `path`.
pub fn get_file_info(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Err(CompressError::FileNotFound);
    }

    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(CompressError::Unreadable)
}

/// Human-readable file size with binary units and one decimal place.
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", size, UNITS[unit])
}

/// Default destination for a compressed copy: `<stem>_compressed.pdf`
/// alongside the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    input.with_file_name(format!("{stem}_compressed.pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_clamps_to_floor() {
        assert_eq!(target_resolution(1), 72);
        assert_eq!(target_resolution(8), 72);
    }

    #[test]
    fn resolution_clamps_to_ceiling() {
        assert_eq!(target_resolution(100), 300);
    }

    #[test]
    fn resolution_follows_formula_midrange() {
        assert_eq!(target_resolution(50), 175);
        assert_eq!(target_resolution(80), 250);
    }

    #[test]
    fn resolution_is_monotonic() {
        let mut last = 0;
        for quality in 1..=100u8 {
            let resolution = target_resolution(quality);
            assert!(
                resolution >= last,
                "resolution dropped at quality {quality}"
            );
            last = resolution;
        }
    }

    #[test]
    fn preset_boundaries_select_documented_side() {
        assert_eq!(preset_for_quality(29), "/screen");
        assert_eq!(preset_for_quality(30), "/ebook");
        assert_eq!(preset_for_quality(59), "/ebook");
        assert_eq!(preset_for_quality(60), "/printer");
    }

    #[test]
    fn preset_extremes() {
        assert_eq!(preset_for_quality(1), "/screen");
        assert_eq!(preset_for_quality(100), "/printer");
    }

    #[test]
    fn jpeg_quality_stays_in_band() {
        assert_eq!(jpeg_quality_for(1), 25);
        assert_eq!(jpeg_quality_for(31), 25);
        assert_eq!(jpeg_quality_for(50), 40);
        assert_eq!(jpeg_quality_for(94), 75);
        assert_eq!(jpeg_quality_for(100), 75);
    }

    #[test]
    fn scale_factor_clamps_below_half() {
        assert_eq!(scale_factor_for(1), 0.5);
        assert_eq!(scale_factor_for(50), 0.5);
    }

    #[test]
    fn scale_factor_tracks_quality_above_half() {
        assert!((scale_factor_for(75) - 0.75).abs() < 1e-9);
        assert_eq!(scale_factor_for(100), 1.0);
    }

    #[test]
    fn target_dimensions_floor_at_200() {
        assert_eq!(target_dimensions(300, 300, 0.5), (200, 200));
        assert_eq!(target_dimensions(150, 3000, 0.5), (200, 1500));
    }

    #[test]
    fn target_dimensions_scale_when_above_floor() {
        assert_eq!(target_dimensions(1000, 600, 0.5), (500, 300));
        assert_eq!(target_dimensions(1000, 600, 1.0), (1000, 600));
    }

    #[test]
    fn resize_gate_requires_meaningful_shrink() {
        assert!(should_resize(1000, 1000, 500, 500));
        assert!(should_resize(300, 300, 260, 280));
        assert!(!should_resize(300, 300, 280, 280));
        // The 200 floor can push a target above the original; never resize up.
        assert!(!should_resize(150, 150, 200, 200));
    }

    #[test]
    fn substitution_needs_five_percent_savings() {
        assert!(substitution_accepted(1000, 949));
        assert!(!substitution_accepted(1000, 950));
        assert!(!substitution_accepted(1000, 960));
        assert!(!substitution_accepted(1000, 1000));
    }

    #[test]
    fn file_sizes_format_with_binary_units() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512.0 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1048576), "1.0 MB");
        assert_eq!(format_file_size(1073741824), "1.0 GB");
    }

    #[test]
    fn default_output_keeps_directory_and_adds_suffix() {
        assert_eq!(
            default_output_path(Path::new("/docs/report.pdf")),
            Path::new("/docs/report_compressed.pdf")
        );
        assert_eq!(
            default_output_path(Path::new("scan.pdf")),
            Path::new("scan_compressed.pdf")
        );
    }

    #[test]
    fn default_output_preserves_stem_with_dots() {
        assert_eq!(
            default_output_path(Path::new("/a/report.v2.pdf")),
            Path::new("/a/report.v2_compressed.pdf")
        );
    }

    #[test]
    fn primary_filter_reads_single_name() {
        let mut dict = Dictionary::new();
        dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        assert_eq!(primary_filter(&dict).as_deref(), Some("FlateDecode"));
    }

    #[test]
    fn primary_filter_reads_first_array_entry() {
        let mut dict = Dictionary::new();
        dict.set(
            "Filter",
            Object::Array(vec![
                Object::Name(b"FlateDecode".to_vec()),
                Object::Name(b"DCTDecode".to_vec()),
            ]),
        );
        assert_eq!(primary_filter(&dict).as_deref(), Some("FlateDecode"));
    }

    #[test]
    fn dict_u32_ignores_non_integers() {
        let mut dict = Dictionary::new();
        dict.set("Width", Object::Real(12.5));
        assert_eq!(dict_u32(&dict, b"Width"), None);
        dict.set("Width", Object::Integer(640));
        assert_eq!(dict_u32(&dict, b"Width"), Some(640));
    }
}
