use qrcode::QrCode;
use vpnctl_core::VpnctlError;

/// Renders `data` (a WireGuard client config) as a PNG-encoded QR code,
/// matching the original's `qrcode` + Pillow pipeline.
pub fn render_qr_png(data: &str) -> Result<Vec<u8>, VpnctlError> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| VpnctlError::Other(format!("qr encode: {e}")))?;

    let image = code
        .render::<image::Luma<u8>>()
        .min_dimensions(256, 256)
        .build();

    let mut buf = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| VpnctlError::Other(format!("qr png encode: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_nonempty_png() {
        let png = render_qr_png("[Interface]\nPrivateKey = test\n").unwrap();
        // PNG signature
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n']);
    }
}
