pub mod notifier;
pub mod qr;

pub use notifier::{Notifier, TelegramNotifier};
pub use qr::render_qr_png;
