//! Status lines the modem sends on its own

/// Classified line received outside of a command exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `SMS Ready`: the modem finished its boot and SMS services are up
    SmsReady,
    /// `Call Ready`
    CallReady,
    /// `+CPIN: READY`
    SimReady,
    /// The modem announced it is switching itself off
    PowerDown(String),
    /// Anything else
    Other(String),
}

impl Notification {
    /// Classify a trimmed line
    pub fn parse(line: &str) -> Self {
        match line {
            crate::at::SMS_READY => Notification::SmsReady,
            "Call Ready" => Notification::CallReady,
            "+CPIN: READY" => Notification::SimReady,
            "NORMAL POWER DOWN" | "UNDER-VOLTAGE POWER DOWN" | "OVER-VOLTAGE POWER DOWN" => {
                Notification::PowerDown(line.to_string())
            }
            _ => Notification::Other(line.to_string()),
        }
    }
}
