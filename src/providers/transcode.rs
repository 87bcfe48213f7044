use std::borrow::Cow;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{
    DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder, ImageError, ImageFormat,
    ImageReader,
};
use tokio::task::JoinError;

const JPEG_QUALITY: u8 = 90;

/// Returns `bytes` unchanged when they already are a JPEG, otherwise decodes
/// and re-encodes them as a baseline RGB JPEG. EXIF metadata is carried over.
pub(crate) fn ensure_jpeg(bytes: &[u8]) -> Result<Cow<'_, [u8]>, ImageError> {
    let format = image::guess_format(bytes)?;
    if format == ImageFormat::Jpeg {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut decoder = ImageReader::with_format(Cursor::new(bytes), format).into_decoder()?;
    let exif = decoder.exif_metadata()?;
    let rgb = DynamicImage::from_decoder(decoder)?.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut out = Vec::with_capacity(bytes.len());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    if let Some(exif) = exif {
        encoder
            .set_exif_metadata(exif)
            .map_err(ImageError::Unsupported)?;
    }
    encoder.write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)?;
    Ok(Cow::Owned(out))
}

/// [`ensure_jpeg`] on the blocking pool. Decoding a large original would
/// otherwise hold a runtime worker for the whole conversion.
pub(crate) async fn ensure_jpeg_owned(
    bytes: Vec<u8>,
) -> Result<Result<Vec<u8>, ImageError>, JoinError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ImageError> {
        let converted = match ensure_jpeg(&bytes)? {
            Cow::Owned(jpeg) => Some(jpeg),
            Cow::Borrowed(_) => None,
        };
        Ok(converted.unwrap_or(bytes))
    })
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::RgbImage;
    use image::codecs::png::PngEncoder;

    /// Big-endian TIFF header with an empty IFD.
    const EXIF: &[u8] = b"MM\x00\x2a\x00\x00\x00\x08\x00\x00\x00\x00\x00\x00";

    fn encode_png(exif: Option<&[u8]>) -> Vec<u8> {
        let image = RgbImage::from_fn(8, 8, |x, y| image::Rgb([(x * 30) as u8, (y * 30) as u8, 128]));
        let mut out = Vec::new();
        let mut encoder = PngEncoder::new(&mut out);
        if let Some(exif) = exif {
            encoder.set_exif_metadata(exif.to_vec()).unwrap();
        }
        encoder
            .write_image(image.as_raw(), 8, 8, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    pub(crate) fn png_bytes() -> Vec<u8> {
        encode_png(None)
    }

    pub(crate) fn jpeg_bytes() -> Vec<u8> {
        let png = png_bytes();
        ensure_jpeg(&png).unwrap().into_owned()
    }

    fn exif_of(bytes: &[u8]) -> Option<Vec<u8>> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .unwrap()
            .into_decoder()
            .unwrap()
            .exif_metadata()
            .unwrap()
    }

    #[test]
    fn png_is_transcoded_to_jpeg() {
        let png = png_bytes();
        let converted = ensure_jpeg(&png).unwrap();

        assert!(matches!(converted, Cow::Owned(_)));
        assert_eq!(image::guess_format(&converted).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&converted).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[test]
    fn exif_survives_transcoding() {
        let png = encode_png(Some(EXIF));
        assert_eq!(exif_of(&png).as_deref(), Some(EXIF));

        let converted = ensure_jpeg(&png).unwrap();

        assert_eq!(image::guess_format(&converted).unwrap(), ImageFormat::Jpeg);
        assert_eq!(exif_of(&converted).as_deref(), Some(EXIF));
    }

    #[test]
    fn jpeg_passes_through_untouched() {
        let jpeg = jpeg_bytes();
        let converted = ensure_jpeg(&jpeg).unwrap();

        assert!(matches!(converted, Cow::Borrowed(_)));
        assert_eq!(converted.as_ref(), jpeg.as_slice());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ensure_jpeg(b"definitely not an image").is_err());
    }

    #[tokio::test]
    async fn blocking_conversion_keeps_jpeg_and_converts_png() {
        let jpeg = jpeg_bytes();

        let kept = ensure_jpeg_owned(jpeg.clone()).await.unwrap().unwrap();
        let converted = ensure_jpeg_owned(png_bytes()).await.unwrap().unwrap();

        assert_eq!(kept, jpeg);
        assert_eq!(image::guess_format(&converted).unwrap(), ImageFormat::Jpeg);
        assert!(
            ensure_jpeg_owned(b"nope".to_vec())
                .await
                .unwrap()
                .is_err()
        );
    }
}
