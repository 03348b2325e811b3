use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery to {address} failed: {reason}")]
    Delivery { address: String, reason: String },
}

/// Outbound delivery of codes. Best effort; callers never fail on it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

pub const BROADCAST_SUBJECT: &str = "Class Attendance OTP";
pub const REQUEST_SUBJECT: &str = "Request Attendance OTP";

pub fn otp_body(code: &str, valid_seconds: i64) -> String {
    let minutes = valid_seconds / 60;
    if minutes > 0 && valid_seconds % 60 == 0 {
        format!("Your OTP is: {} (Valid for {} minutes)", code, minutes)
    } else {
        format!("Your OTP is: {} (Valid for {} seconds)", code, valid_seconds)
    }
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        log::info!("[{}] to {}: {}", subject, address, body);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_mentions_validity() {
        assert_eq!(otp_body("123456", 120), "Your OTP is: 123456 (Valid for 2 minutes)");
        assert_eq!(otp_body("123456", 90), "Your OTP is: 123456 (Valid for 90 seconds)");
    }
}
