//! About dialog shown as a desktop notification.

use std::collections::HashMap;

use zbus::{Connection, proxy, zvariant::Value};

use crate::{error::Result, tray::TRAY_TITLE};

pub const ABOUT_NAME: &str = "Parrot Zik Tray";

/// How long the About notification stays up, in milliseconds.
const ABOUT_TIMEOUT_MS: i32 = 10_000;

#[proxy(
   interface = "org.freedesktop.Notifications",
   default_service = "org.freedesktop.Notifications",
   default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
   #[allow(clippy::too_many_arguments)]
   fn notify(
      &self,
      app_name: &str,
      replaces_id: u32,
      app_icon: &str,
      summary: &str,
      body: &str,
      actions: &[&str],
      hints: HashMap<&str, Value<'_>>,
      expire_timeout: i32,
   ) -> zbus::Result<u32>;
}

/// Static text of the About dialog.
pub fn about_text() -> (String, String) {
   let summary = format!("{ABOUT_NAME} {}", env!("CARGO_PKG_VERSION"));
   let authors = env!("CARGO_PKG_AUTHORS").replace(':', "\n");
   let body = format!("{}\n\nAuthors:\n{authors}", env!("CARGO_PKG_DESCRIPTION"));
   (summary, body)
}

pub async fn show_about(connection: &Connection, icon: &str) -> Result<u32> {
   let proxy = NotificationsProxy::new(connection).await?;
   let (summary, body) = about_text();
   let id = proxy
      .notify(
         TRAY_TITLE,
         0,
         icon,
         &summary,
         &body,
         &[],
         HashMap::new(),
         ABOUT_TIMEOUT_MS,
      )
      .await?;
   Ok(id)
}
