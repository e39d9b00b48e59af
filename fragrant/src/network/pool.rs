use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::Cidr;

/// Errors from claiming or releasing pool addresses.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no more addresses available in range {range}")]
    AddressRangeExhausted { range: Cidr },

    #[error("environment {0} already has an address")]
    DuplicateClaim(String),

    #[error("no addresses registered to environment {0}")]
    UnknownEnvironment(String),

    #[error("address pool file {} is unreadable: {reason}", .path.display())]
    PersistedStateUnreadable { path: PathBuf, reason: String },

    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// On-disk form of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPool {
    pub address_range: String,
    pub allocated_addresses: Vec<Ipv4Addr>,
    pub address_map: BTreeMap<String, Ipv4Addr>,
}

/// In-memory address bookkeeping for one CIDR block.
///
/// `claimed` always equals the value set of `assignments`.
#[derive(Debug, Clone)]
pub struct AddressPool {
    range: Cidr,
    assignments: BTreeMap<String, Ipv4Addr>,
    claimed: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// An empty pool over `range`.
    pub fn new(range: Cidr) -> Self {
        Self {
            range,
            assignments: BTreeMap::new(),
            claimed: BTreeSet::new(),
        }
    }

    /// Rebuild a pool from its persisted form, rejecting inconsistent data.
    pub fn from_persisted(persisted: PersistedPool) -> anyhow::Result<Self> {
        let range: Cidr = persisted
            .address_range
            .parse()
            .context("invalid address_range")?;

        let mut claimed = BTreeSet::new();
        for addr in &persisted.allocated_addresses {
            if !claimed.insert(*addr) {
                bail!("address {} listed twice in allocated_addresses", addr);
            }
            if !range.is_host(*addr) {
                bail!("allocated address {} is outside {}", addr, range);
            }
        }

        let mut mapped = BTreeSet::new();
        for (id, addr) in &persisted.address_map {
            if !mapped.insert(*addr) {
                bail!("address {} is assigned to more than one environment (one is {})", addr, id);
            }
        }

        if mapped != claimed {
            bail!("allocated_addresses does not match the addresses in address_map");
        }

        Ok(Self {
            range,
            assignments: persisted.address_map,
            claimed,
        })
    }

    pub fn to_persisted(&self) -> PersistedPool {
        PersistedPool {
            address_range: self.range.to_string(),
            allocated_addresses: self.claimed.iter().copied().collect(),
            address_map: self.assignments.clone(),
        }
    }

    pub fn range(&self) -> Cidr {
        self.range
    }

    pub fn assignments(&self) -> &BTreeMap<String, Ipv4Addr> {
        &self.assignments
    }

    pub fn address_of(&self, environment_id: &str) -> Option<Ipv4Addr> {
        self.assignments.get(environment_id).copied()
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }

    /// Lowest host address of the range that nobody holds.
    pub fn first_available(&self) -> Option<Ipv4Addr> {
        self.range.hosts().find(|ip| !self.claimed.contains(ip))
    }

    /// Assign the lowest free address to `environment_id`.
    pub fn claim(&mut self, environment_id: &str) -> Result<Ipv4Addr, AllocError> {
        if self.assignments.contains_key(environment_id) {
            return Err(AllocError::DuplicateClaim(environment_id.to_string()));
        }
        let addr = self
            .first_available()
            .ok_or(AllocError::AddressRangeExhausted { range: self.range })?;
        self.assignments.insert(environment_id.to_string(), addr);
        self.claimed.insert(addr);
        Ok(addr)
    }

    /// Drop the assignment held by `environment_id`, returning its address.
    pub fn release(&mut self, environment_id: &str) -> Result<Ipv4Addr, AllocError> {
        let addr = self
            .assignments
            .remove(environment_id)
            .ok_or_else(|| AllocError::UnknownEnvironment(environment_id.to_string()))?;
        self.claimed.remove(&addr);
        Ok(addr)
    }

    fn restore(&mut self, environment_id: &str, addr: Ipv4Addr) {
        self.assignments.insert(environment_id.to_string(), addr);
        self.claimed.insert(addr);
    }
}

/// Point-in-time view of the pool for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolUsage {
    pub address_range: String,
    pub capacity: u64,
    pub claimed: usize,
    pub assignments: BTreeMap<String, Ipv4Addr>,
}

/// Durable, lock-protected address pool.
///
/// The pool file is read lazily on first use. Every claim and release is
/// written through to disk while the lock is held; if the write fails the
/// in-memory change is rolled back, so an address assigned in memory is
/// always assigned on disk.
pub struct AddressAllocator {
    path: PathBuf,
    configured_range: Cidr,
    pool: Mutex<Option<AddressPool>>,
}

impl AddressAllocator {
    pub fn new(path: PathBuf, configured_range: Cidr) -> Self {
        Self {
            path,
            configured_range,
            pool: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force the pool file to be read now instead of on first use.
    pub async fn load(&self) -> Result<(), AllocError> {
        self.loaded().await.map(|_| ())
    }

    /// Claim the lowest free address for `environment_id` and persist it.
    pub async fn claim_address(&self, environment_id: &str) -> Result<Ipv4Addr, AllocError> {
        let mut pool = self.loaded().await?;
        let addr = pool.claim(environment_id)?;

        if let Err(e) = persist(&self.path, &pool.to_persisted()).await {
            pool.release(environment_id)?;
            warn!(
                environment_id = %environment_id,
                ip = %addr,
                error = %e,
                "address claim rolled back, pool file not written"
            );
            return Err(AllocError::Persist(e));
        }

        info!(environment_id = %environment_id, ip = %addr, "claimed address");
        Ok(addr)
    }

    /// Release the address held by `environment_id` and persist the change.
    pub async fn release_addresses(&self, environment_id: &str) -> Result<Ipv4Addr, AllocError> {
        let mut pool = self.loaded().await?;
        let addr = pool.release(environment_id)?;

        if let Err(e) = persist(&self.path, &pool.to_persisted()).await {
            pool.restore(environment_id, addr);
            warn!(
                environment_id = %environment_id,
                ip = %addr,
                error = %e,
                "address release rolled back, pool file not written"
            );
            return Err(AllocError::Persist(e));
        }

        info!(environment_id = %environment_id, ip = %addr, "released address");
        Ok(addr)
    }

    /// Address currently held by `environment_id`, if any.
    pub async fn address_of(&self, environment_id: &str) -> Result<Option<Ipv4Addr>, AllocError> {
        Ok(self.loaded().await?.address_of(environment_id))
    }

    pub async fn usage(&self) -> Result<PoolUsage, AllocError> {
        let pool = self.loaded().await?;
        Ok(PoolUsage {
            address_range: pool.range().to_string(),
            capacity: pool.range().usable_count(),
            claimed: pool.claimed_count(),
            assignments: pool.assignments().clone(),
        })
    }

    async fn loaded(&self) -> Result<MappedMutexGuard<'_, AddressPool>, AllocError> {
        let mut guard = self.pool.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_pool().await?);
        }
        let range = self.configured_range;
        Ok(MutexGuard::map(guard, |slot| {
            slot.get_or_insert_with(|| AddressPool::new(range))
        }))
    }

    async fn read_pool(&self) -> Result<AddressPool, AllocError> {
        let unreadable = |reason: String| AllocError::PersistedStateUnreadable {
            path: self.path.clone(),
            reason,
        };

        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    path = %self.path.display(),
                    range = %self.configured_range,
                    "no address pool file, starting with an empty pool"
                );
                return Ok(AddressPool::new(self.configured_range));
            }
            Err(e) => return Err(unreadable(e.to_string())),
        };

        let persisted: PersistedPool =
            serde_json::from_str(&data).map_err(|e| unreadable(e.to_string()))?;
        let pool = AddressPool::from_persisted(persisted).map_err(|e| unreadable(format!("{:#}", e)))?;

        if pool.range() != self.configured_range {
            warn!(
                persisted = %pool.range(),
                configured = %self.configured_range,
                "address pool file was created for a different range, keeping the persisted range"
            );
        }

        info!(
            path = %self.path.display(),
            range = %pool.range(),
            claimed = pool.claimed_count(),
            "loaded address pool"
        );
        Ok(pool)
    }
}

/// Write the pool to `path` through a temp file and rename.
async fn persist(path: &Path, pool: &PersistedPool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating pool directory: {}", parent.display()))?;
    }

    let data = serde_json::to_string_pretty(pool).context("serializing address pool")?;

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("writing temp pool file: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming temp pool file to: {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await.ok();

    debug!(path = %path.display(), "address pool persisted");
    Ok(())
}
