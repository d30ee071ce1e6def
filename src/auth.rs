use sha1::{Digest, Sha1};

pub fn stage2_from_password(password: &[u8]) -> [u8; 20] {
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    stage2.into()
}

/// Verify the mysql_native_password token (auth_data) against the stored stage2 hash.
///
/// Stored form is SHA1(SHA1(password)) (20 bytes).
pub fn verify_native_password_token(salt: &[u8], stored_stage2: &[u8; 20], auth_data: &[u8]) -> bool {
    if auth_data.len() != 20 {
        return false;
    }

    // token = stage1 XOR SHA1(salt + stage2)
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stored_stage2);
    let salt_stage2_hash: [u8; 20] = hasher.finalize().into();

    let mut stage1 = [0u8; 20];
    for (out, (token, mask)) in stage1
        .iter_mut()
        .zip(auth_data.iter().zip(salt_stage2_hash.iter()))
    {
        *out = token ^ mask;
    }

    let stage2_check: [u8; 20] = Sha1::digest(stage1).into();
    stage2_check == *stored_stage2
}

/// The one account the sandbox server accepts.
#[derive(Debug, Clone)]
pub struct SandboxCredentials {
    user: String,
    stage2: Option<[u8; 20]>,
}

impl SandboxCredentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            stage2: (!password.is_empty()).then(|| stage2_from_password(password.as_bytes())),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn verify(&self, auth_plugin: &str, username: &[u8], salt: &[u8], auth_data: &[u8]) -> bool {
        if auth_plugin != "mysql_native_password" {
            return false;
        }
        if std::str::from_utf8(username).ok() != Some(self.user.as_str()) {
            return false;
        }
        match &self.stage2 {
            // Empty password is sent as empty auth_data.
            None => auth_data.is_empty(),
            Some(stage2) => verify_native_password_token(salt, stage2, auth_data),
        }
    }
}
