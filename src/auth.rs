use anyhow::{Context, Result};
use std::io::{self, BufRead, IsTerminal};
use std::path::Path;
use zeroize::Zeroizing;

pub const PASSWORD_ENV: &str = "MASTERKDF_PASSWORD";

/// Reads the password as bytes. An empty password is valid input: whether to
/// allow one is up to whoever owns the database.
pub fn read_password() -> Result<Zeroizing<Vec<u8>>> {
    //  Environment variable, set but empty means an empty password
    //  MASTERKDF_PASSWORD="supersecret" masterkdf derive ...
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(pw.into_bytes()));
    }

    //  stdin (pipeline)
    //  printf "%s\n" "$PW" | masterkdf derive ...
    if !io::stdin().is_terminal() {
        let mut buf = Zeroizing::new(String::new());
        io::stdin().lock().read_line(&mut buf)?;
        trim_newline(&mut buf);
        return Ok(Zeroizing::new(buf.as_bytes().to_vec()));
    }

    //  interactive (TTY)
    let pw = Zeroizing::new(rpassword::prompt_password("Password: ")?);
    Ok(Zeroizing::new(pw.as_bytes().to_vec()))
}

/// Reads keyfile contents; hashing them is the library's job.
pub fn read_keyfile(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read keyfile {}", path.display()))?;
    Ok(Zeroizing::new(data))
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
