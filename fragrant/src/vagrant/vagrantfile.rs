use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};

pub const VAGRANTFILE: &str = "Vagrantfile";

/// Quote `s` as a single-quoted Ruby literal, which never interpolates.
fn ruby_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Renders an environment's `Vagrantfile` and its provisioning scripts.
#[derive(Debug, Clone)]
pub struct VagrantfileGenerator {
    box_name: String,
    box_url: String,
    addresses: Vec<Ipv4Addr>,
    scripts: Vec<String>,
    contents: Option<String>,
}

impl VagrantfileGenerator {
    pub fn new(box_name: impl Into<String>, box_url: impl Into<String>) -> Self {
        Self {
            box_name: box_name.into(),
            box_url: box_url.into(),
            addresses: Vec::new(),
            scripts: Vec::new(),
            contents: None,
        }
    }

    /// A generator that writes `contents` verbatim instead of rendering.
    pub fn with_contents(contents: impl Into<String>) -> Self {
        let mut generator = Self::new("", "");
        generator.contents = Some(contents.into());
        generator
    }

    pub fn address(mut self, addr: Ipv4Addr) -> Self {
        self.addresses.push(addr);
        self
    }

    pub fn add_script(&mut self, body: impl Into<String>) -> Result<()> {
        if self.contents.is_some() {
            bail!("Vagrantfile body set explicitly, adding a script is not supported");
        }
        self.scripts.push(body.into());
        Ok(())
    }

    /// Script file names paired with their bodies: `script001`, `script002`, ...
    fn named_scripts(&self) -> Vec<(String, &str)> {
        self.scripts
            .iter()
            .enumerate()
            .map(|(i, body)| (format!("script{:03}", i + 1), body.as_str()))
            .collect()
    }

    pub fn render(&self) -> String {
        if let Some(contents) = &self.contents {
            return contents.clone();
        }

        let mut out = String::new();
        out.push_str("# Generated by fragrant. Changes are overwritten on re-create.\n");
        out.push_str("Vagrant.configure(\"2\") do |config|\n");
        let _ = writeln!(out, "  config.vm.box = {}", ruby_str(&self.box_name));
        if !self.box_url.is_empty() {
            let _ = writeln!(out, "  config.vm.box_url = {}", ruby_str(&self.box_url));
        }
        for addr in &self.addresses {
            let _ = writeln!(out, "  config.vm.network :private_network, ip: '{}'", addr);
        }
        for (name, _) in self.named_scripts() {
            let _ = writeln!(out, "  config.vm.provision :shell, path: {}", ruby_str(&name));
        }
        out.push_str("end\n");
        out
    }

    /// Write scripts (mode 0755) and the `Vagrantfile` into `dir`.
    pub async fn write(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating environment directory: {}", dir.display()))?;

        for (name, body) in self.named_scripts() {
            let path = dir.join(&name);
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("writing provisioning script: {}", path.display()))?;
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("making script executable: {}", path.display()))?;
        }

        let path = dir.join(VAGRANTFILE);
        tokio::fs::write(&path, self.render())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
