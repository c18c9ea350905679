//! Per-page perceptual hashes.
//!
//! phash, dhash and ahash come from img_hash; the wavelet hash is a Haar
//! decomposition computed here. All four are stored base64-encoded, the
//! same encoding img_hash uses, so any pair can be compared with
//! [`hamming_distance`].

use base64::Engine;
use image::imageops::FilterType;
use image::DynamicImage;
use img_hash::{HashAlg, Hasher, HasherConfig, ImageHash};

use crate::models::PageHashes;

/// Side of the grayscale raster the wavelet transform starts from.
const WHASH_BASE: u32 = 32;

pub struct PageHasher {
    phash: Hasher,
    dhash: Hasher,
    ahash: Hasher,
    hash_size: u32,
}

impl PageHasher {
    pub fn new(hash_size: u32) -> Self {
        let config = || HasherConfig::new().hash_size(hash_size, hash_size);
        Self {
            phash: config().hash_alg(HashAlg::Mean).preproc_dct().to_hasher(),
            dhash: config().hash_alg(HashAlg::Gradient).to_hasher(),
            ahash: config().hash_alg(HashAlg::Mean).to_hasher(),
            hash_size,
        }
    }

    pub fn hash_page(&self, image: &DynamicImage) -> PageHashes {
        PageHashes {
            phash: self.phash.hash_image(image).to_base64(),
            dhash: self.dhash.hash_image(image).to_base64(),
            ahash: self.ahash.hash_image(image).to_base64(),
            whash: base64::engine::general_purpose::STANDARD
                .encode(wavelet_hash(image, self.hash_size)),
        }
    }
}

/// Number of differing bits between two encoded hashes.
///
/// `None` when either value does not decode or the lengths differ
/// (hashes computed with different sizes are not comparable).
pub fn hamming_distance(a: &str, b: &str) -> Option<u32> {
    let a = ImageHash::<Vec<u8>>::from_base64(a).ok()?;
    let b = ImageHash::<Vec<u8>>::from_base64(b).ok()?;
    if a.as_bytes().len() != b.as_bytes().len() {
        return None;
    }
    Some(a.dist(&b))
}

/// Haar wavelet hash: low-frequency band of a multi-level 2D Haar
/// transform, thresholded at its median.
///
/// Non power-of-two sizes round up to the next power of two.
pub fn wavelet_hash(image: &DynamicImage, hash_size: u32) -> Vec<u8> {
    let target = hash_size.max(2).next_power_of_two();
    let base = WHASH_BASE.max(target) as usize;

    let gray = image
        .resize_exact(base as u32, base as u32, FilterType::Lanczos3)
        .to_luma8();
    let mut data: Vec<f32> = gray.pixels().map(|p| p.0[0] as f32 / 255.0).collect();

    let mut size = base;
    while size > target as usize {
        haar_step(&mut data, base, size);
        size /= 2;
    }

    let mut band: Vec<f32> = (0..size)
        .flat_map(|y| (0..size).map(move |x| (y, x)))
        .map(|(y, x)| data[y * base + x])
        .collect();

    let mut sorted = band.clone();
    sorted.sort_by(f32::total_cmp);
    let median = (sorted[sorted.len() / 2] + sorted[(sorted.len() - 1) / 2]) / 2.0;

    let mut bytes = vec![0u8; (band.len() + 7) / 8];
    for (i, value) in band.drain(..).enumerate() {
        if value > median {
            bytes[i / 8] |= 1 << (7 - i % 8);
        }
    }
    bytes
}

/// One Haar level over the top-left `size` x `size` block of a row-major
/// buffer with row length `stride`: averages land in the first half of each
/// axis, details in the second.
fn haar_step(data: &mut [f32], stride: usize, size: usize) {
    let half = size / 2;
    let mut scratch = vec![0.0f32; size];

    for y in 0..size {
        let row = &mut data[y * stride..y * stride + size];
        for i in 0..half {
            let (a, b) = (row[2 * i], row[2 * i + 1]);
            scratch[i] = (a + b) / 2.0;
            scratch[half + i] = (a - b) / 2.0;
        }
        row.copy_from_slice(&scratch);
    }

    for x in 0..size {
        for i in 0..half {
            let a = data[(2 * i) * stride + x];
            let b = data[(2 * i + 1) * stride + x];
            scratch[i] = (a + b) / 2.0;
            scratch[half + i] = (a - b) / 2.0;
        }
        for (y, value) in scratch.iter().enumerate() {
            data[y * stride + x] = *value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fingerprint::render::block_pattern;
    use image::ImageOutputFormat;

    const T: u32 = 10;

    fn page(seed: u64, side: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(block_pattern(seed, side, side * 13 / 10))
    }

    fn recompress_jpeg(image: &DynamicImage, quality: u8) -> DynamicImage {
        let mut buf = std::io::Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageOutputFormat::Jpeg(quality)).unwrap();
        image::load_from_memory(buf.get_ref()).unwrap()
    }

    fn distances(a: &PageHashes, b: &PageHashes) -> [u32; 4] {
        [
            hamming_distance(&a.phash, &b.phash).unwrap(),
            hamming_distance(&a.dhash, &b.dhash).unwrap(),
            hamming_distance(&a.ahash, &b.ahash).unwrap(),
            hamming_distance(&a.whash, &b.whash).unwrap(),
        ]
    }

    #[test]
    fn identical_renders_identical_hashes() {
        let hasher = PageHasher::new(8);
        assert_eq!(hasher.hash_page(&page(3, 240)), hasher.hash_page(&page(3, 240)));
    }

    #[test]
    fn hashes_are_64_bits_at_size_8() {
        let hashes = PageHasher::new(8).hash_page(&page(1, 160));
        for encoded in [&hashes.phash, &hashes.dhash, &hashes.ahash, &hashes.whash] {
            let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
            assert_eq!(decoded.len(), 8);
        }
    }

    #[test]
    fn rescaled_and_recompressed_page_within_threshold() {
        let hasher = PageHasher::new(8);
        let original = hasher.hash_page(&page(11, 320));
        let low_res = hasher.hash_page(&recompress_jpeg(&page(11, 160), 60));

        let [phash, ..] = distances(&original, &low_res);
        assert!(phash <= T, "Same page at different DPI drifted {phash} bits");
    }

    #[test]
    fn unrelated_pages_exceed_threshold() {
        let hasher = PageHasher::new(8);
        let a = hasher.hash_page(&page(100, 240));
        let b = hasher.hash_page(&page(200, 240));
        let [phash, ..] = distances(&a, &b);
        assert!(phash > T, "Unrelated pages only {phash} bits apart");
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let hasher = PageHasher::new(8);
        let a = hasher.hash_page(&page(5, 200));
        let b = hasher.hash_page(&page(6, 200));
        assert_eq!(distances(&a, &a), [0; 4]);
        assert_eq!(distances(&a, &b), distances(&b, &a));
    }

    #[test]
    fn mismatched_sizes_not_comparable() {
        let small = PageHasher::new(8).hash_page(&page(1, 200));
        let large = PageHasher::new(16).hash_page(&page(1, 200));
        assert!(hamming_distance(&small.phash, &large.phash).is_none());
        assert!(hamming_distance("not base64!", &small.phash).is_none());
    }

    #[test]
    fn haar_step_averages_constant_block() {
        let mut data = vec![0.5f32; 16];
        haar_step(&mut data, 4, 4);
        assert_eq!(data[0], 0.5);
        assert_eq!(data[1], 0.5);
        assert_eq!(data[2], 0.0, "No horizontal detail in a flat block");
        assert_eq!(data[8], 0.0, "No vertical detail in a flat block");
    }
}
