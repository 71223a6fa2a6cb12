use crate::CoreError;
use convoy_schema::{Secret, Vault, VaultError, VaultSecret};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Vault backed by an external command.
///
/// `{vault_id}` in any argument is replaced by the secret's vault id. The
/// ciphertext is written to stdin; stdout, minus the trailing newline, is
/// the plaintext.
#[derive(Debug, Clone)]
pub struct CommandVault {
    argv: Vec<String>,
}

impl CommandVault {
    pub fn new(argv: Vec<String>) -> Result<Self, CoreError> {
        if !matches!(argv.first(), Some(program) if !program.trim().is_empty()) {
            return Err(CoreError::Config(
                "vault command must name a program".to_owned(),
            ));
        }
        Ok(Self { argv })
    }

    fn args_for(&self, vault_id: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.replace("{vault_id}", vault_id))
            .collect()
    }
}

impl Vault for CommandVault {
    fn decrypt(&self, secret: &VaultSecret) -> Result<Secret, VaultError> {
        let fail = |reason: String| VaultError::Decrypt {
            vault_id: secret.vault_id.clone(),
            reason,
        };
        let args = self.args_for(&secret.vault_id);
        debug!("decrypting secret from vault '{}' with {}", secret.vault_id, args[0]);

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(format!("cannot run '{}': {e}", args[0])))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(secret.ciphertext.as_bytes())
                .map_err(|e| fail(format!("writing ciphertext: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| fail(format!("waiting for vault command: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "{} exited with {}: {}",
                args[0],
                output.status,
                stderr.trim()
            )));
        }

        let plaintext = String::from_utf8(output.stdout)
            .map_err(|_| fail("vault output is not UTF-8".to_owned()))?;
        let plaintext = plaintext
            .strip_suffix('\n')
            .map(|s| s.strip_suffix('\r').unwrap_or(s))
            .unwrap_or(&plaintext);
        Ok(Secret::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandVault {
        CommandVault::new(vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]).unwrap()
    }

    #[test]
    fn decrypts_through_stdin() {
        let vault = sh("tr a-z A-Z");
        let plain = vault.decrypt(&VaultSecret::new("hunter2", "main")).unwrap();
        assert_eq!(plain.expose(), "HUNTER2");
    }

    #[test]
    fn substitutes_vault_id() {
        let vault = sh("cat >/dev/null; echo {vault_id}");
        let plain = vault.decrypt(&VaultSecret::new("x", "prod")).unwrap();
        assert_eq!(plain.expose(), "prod");
    }

    #[test]
    fn failing_command_names_vault() {
        let vault = sh("cat >/dev/null; echo bad key >&2; exit 3");
        let err = vault.decrypt(&VaultSecret::new("x", "prod")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("prod"), "{msg}");
        assert!(msg.contains("bad key"), "{msg}");
    }

    #[test]
    fn empty_command_rejected() {
        assert!(CommandVault::new(Vec::new()).is_err());
        assert!(CommandVault::new(vec![" ".to_owned()]).is_err());
    }
}
