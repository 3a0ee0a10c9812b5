//! Builders for the API command strings the engine issues.

use crate::variables::Variables;
use std::fmt;

/// `uuid_bridge <leg_a> <leg_b>`: bridge two existing legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidBridge {
    pub leg_a: String,
    pub leg_b: String,
}

impl fmt::Display for UuidBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uuid_bridge {} {}", self.leg_a, self.leg_b)
    }
}

/// `uuid_transfer <uuid> [-both] <target> inline`: tear a leg out of its
/// bridge.
///
/// Parking transfers both legs to the `park:` target; otherwise only the
/// named leg moves to the destination (which may be absent for a bare
/// unbridge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidTransfer {
    pub uuid: String,
    pub destination: Option<String>,
    pub both: bool,
}

impl UuidTransfer {
    /// Transfer that parks both legs.
    pub fn park(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            destination: Some("park:".to_string()),
            both: true,
        }
    }
}

impl fmt::Display for UuidTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uuid_transfer {}", self.uuid)?;
        if self.both {
            f.write_str(" -both")?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " {destination}")?;
        }
        f.write_str(" inline")
    }
}

/// `originate {vars}<destination> &<application> [timeout=N]`: start a new
/// leg and hand it to a continuation application once answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Originate {
    pub destination: String,
    pub variables: Variables,
    /// Application the leg runs after answer (defaults to `park`).
    pub application_after: String,
    /// Origination timeout in seconds.
    pub timeout: Option<u64>,
}

impl Originate {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            variables: Variables::new(),
            application_after: "park".to_string(),
            timeout: None,
        }
    }
}

impl fmt::Display for Originate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "originate {}{} &{}",
            self.variables, self.destination, self.application_after
        )?;
        if let Some(timeout) = self.timeout {
            write!(f, " timeout={timeout}")?;
        }
        Ok(())
    }
}

/// Argument block for the `say` application:
/// `module[:lang] KIND method GENDER text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Say {
    pub module: String,
    pub lang: Option<String>,
    pub kind: String,
    pub method: String,
    pub gender: String,
    pub text: String,
}

impl Say {
    /// Speak a number with the default English voice settings.
    pub fn number(text: impl Into<String>) -> Self {
        Self {
            module: "en".to_string(),
            lang: None,
            kind: "NUMBER".to_string(),
            method: "pronounced".to_string(),
            gender: "FEMININE".to_string(),
            text: text.into(),
        }
    }
}

impl fmt::Display for Say {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.module)?;
        if let Some(lang) = &self.lang {
            write!(f, ":{lang}")?;
        }
        write!(
            f,
            " {} {} {} {}",
            self.kind, self.method, self.gender, self.text
        )
    }
}

/// Ordered argument block for the `play_and_get_digits` application.
///
/// Argument order is significant on the wire; absent optional fields render
/// as empty slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayAndGetDigits {
    pub min_digits: u32,
    pub max_digits: u32,
    pub tries: u32,
    /// Inter-digit timeout in milliseconds.
    pub timeout: u32,
    pub terminators: String,
    pub file: String,
    pub invalid_file: Option<String>,
    /// Channel variable that receives the collected digits.
    pub var_name: Option<String>,
    pub regexp: Option<String>,
    /// Timeout after the last digit, in milliseconds.
    pub digit_timeout: Option<u32>,
    pub transfer_on_failure: Option<String>,
}

impl fmt::Display for PlayAndGetDigits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |value: &Option<String>| value.clone().unwrap_or_default();
        let parts = [
            self.min_digits.to_string(),
            self.max_digits.to_string(),
            self.tries.to_string(),
            self.timeout.to_string(),
            self.terminators.clone(),
            self.file.clone(),
            opt(&self.invalid_file),
            opt(&self.var_name),
            opt(&self.regexp),
            self.digit_timeout.map(|t| t.to_string()).unwrap_or_default(),
            opt(&self.transfer_on_failure),
        ];
        f.write_str(parts.join(" ").trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_bridge_format() {
        let cmd = UuidBridge {
            leg_a: "a-leg".into(),
            leg_b: "b-leg".into(),
        };
        assert_eq!(cmd.to_string(), "uuid_bridge a-leg b-leg");
    }

    #[test]
    fn uuid_transfer_park_format() {
        assert_eq!(
            UuidTransfer::park("leg-1").to_string(),
            "uuid_transfer leg-1 -both park: inline"
        );
    }

    #[test]
    fn uuid_transfer_destination_format() {
        let cmd = UuidTransfer {
            uuid: "leg-1".into(),
            destination: Some("3000".into()),
            both: false,
        };
        assert_eq!(cmd.to_string(), "uuid_transfer leg-1 3000 inline");
    }

    #[test]
    fn uuid_transfer_bare_unbridge() {
        let cmd = UuidTransfer {
            uuid: "leg-1".into(),
            destination: None,
            both: false,
        };
        assert_eq!(cmd.to_string(), "uuid_transfer leg-1 inline");
    }

    #[test]
    fn originate_format_with_variables_and_timeout() {
        let mut cmd = Originate::new("user/1000");
        cmd.variables.insert("origination_uuid", "leg-9");
        cmd.timeout = Some(30);
        assert_eq!(
            cmd.to_string(),
            "originate {origination_uuid='leg-9'}user/1000 &park timeout=30"
        );
    }

    #[test]
    fn originate_format_minimal() {
        let cmd = Originate::new("user/1000");
        assert_eq!(cmd.to_string(), "originate user/1000 &park");
    }

    #[test]
    fn say_renders_module_lang_and_voice() {
        let mut say = Say::number("123");
        say.lang = Some("us".into());
        assert_eq!(say.to_string(), "en:us NUMBER pronounced FEMININE 123");
        assert_eq!(
            Say::number("42").to_string(),
            "en NUMBER pronounced FEMININE 42"
        );
    }

    #[test]
    fn play_and_get_digits_renders_in_order() {
        let args = PlayAndGetDigits {
            min_digits: 1,
            max_digits: 4,
            tries: 3,
            timeout: 5000,
            terminators: "#".into(),
            file: "/tmp/prompt.wav".into(),
            var_name: Some("digits".into()),
            ..Default::default()
        };
        assert_eq!(args.to_string(), "1 4 3 5000 # /tmp/prompt.wav  digits");
    }
}
