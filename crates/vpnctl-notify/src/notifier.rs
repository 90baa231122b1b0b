use async_trait::async_trait;
use vpnctl_core::{TelegramUserId, VpnctlError};

use crate::qr::render_qr_png;

const INSTRUCTION_TEXT: &str = include_str!("instruction_text.txt");

/// Abstraction over "tell a Telegram user something" so the controller and
/// workers never depend on a concrete HTTP client, only this trait — the
/// same seam the original's `bot.py` module boundary drew between the
/// webhook handlers and the aiogram `Bot` instance.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, telegram_user_id: TelegramUserId, text: &str) -> Result<(), VpnctlError>;

    /// Delivers a freshly provisioned VPN config: the `.conf` file, a QR
    /// rendering of it, and the connection instructions, in that order.
    async fn send_vpn_config(
        &self,
        telegram_user_id: TelegramUserId,
        config_text: &str,
        caption: Option<&str>,
    ) -> Result<(), VpnctlError>;

    /// Best-effort admin notification; failures are logged, never
    /// propagated, since a missed admin ping must not fail the payment flow
    /// that triggered it.
    async fn notify_admin(&self, admin_telegram_id: TelegramUserId, text: &str);
}

#[derive(Clone)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    async fn send_document(
        &self,
        chat_id: TelegramUserId,
        filename: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), VpnctlError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let resp = self
            .http
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        check_telegram_response(resp).await
    }

    async fn send_photo(
        &self,
        chat_id: TelegramUserId,
        filename: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), VpnctlError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);

        let resp = self
            .http
            .post(self.api_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        check_telegram_response(resp).await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(&self, telegram_user_id: TelegramUserId, text: &str) -> Result<(), VpnctlError> {
        let resp = self
            .http
            .post(self.api_url("sendMessage"))
            .form(&[
                ("chat_id", telegram_user_id.to_string()),
                ("text", text.to_string()),
            ])
            .send()
            .await?;
        check_telegram_response(resp).await
    }

    async fn send_vpn_config(
        &self,
        telegram_user_id: TelegramUserId,
        config_text: &str,
        caption: Option<&str>,
    ) -> Result<(), VpnctlError> {
        let caption = caption.unwrap_or(
            "Спасибо за подписку!\n\nНиже — VPN-конфиг WireGuard и QR-код для подключения 👇",
        );

        self.send_document(
            telegram_user_id,
            "vpn.conf",
            config_text.as_bytes().to_vec(),
            caption,
        )
        .await?;

        let qr_png = render_qr_png(config_text)?;
        self.send_photo(
            telegram_user_id,
            "vpn_qr.png",
            qr_png,
            "Отсканируй этот QR в приложении WireGuard 👆",
        )
        .await?;

        self.send_text(telegram_user_id, INSTRUCTION_TEXT).await
    }

    async fn notify_admin(&self, admin_telegram_id: TelegramUserId, text: &str) {
        if admin_telegram_id == 0 {
            return;
        }
        if let Err(e) = self.send_text(admin_telegram_id, text).await {
            tracing::warn!(error = %e, "failed to deliver admin notification");
        }
    }
}

async fn check_telegram_response(resp: reqwest::Response) -> Result<(), VpnctlError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(VpnctlError::Http(format!(
            "telegram API returned {status}: {body}"
        )))
    }
}
