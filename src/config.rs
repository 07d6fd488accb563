/// Namespace-wide shared memory limits, mirroring the Linux `shm` sysctls.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) page_size: u64,
    /// Smallest segment size in bytes (SHMMIN).
    pub(crate) shm_min: u64,
    /// Largest segment size in bytes (SHMMAX).
    pub(crate) shm_max: u64,
    /// Total pages across all segments (SHMALL).
    pub(crate) shm_all: u64,
    /// Maximum number of segments (SHMMNI).
    pub(crate) shm_mni: u32,
    /// Reject reattach-by-key when the requested size differs from the segment's.
    pub(crate) strict_reattach_size: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: 4096,
            shm_min: 1,
            shm_max: 0x2000000,
            shm_all: 0x2000000,
            shm_mni: 4096,
            strict_reattach_size: false,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse `--key=value` flags, ignoring anything unrecognized.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Config::default();
        for arg in args {
            let arg = arg.as_ref();
            if arg == "--strict-reattach" {
                config.strict_reattach_size = true;
                continue;
            }
            let Some((flag, value)) = arg.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                tracing::warn!(flag, value, "ignoring non-numeric flag value");
                continue;
            };
            match flag {
                "--page-size" if value.is_power_of_two() => config.page_size = value,
                "--shmmin" => config.shm_min = value.max(1),
                "--shmmax" => config.shm_max = value,
                "--shmall" => config.shm_all = value,
                "--shmmni" => config.shm_mni = value.min(u32::MAX as u64) as u32,
                _ => tracing::warn!(flag, "ignoring unknown flag"),
            }
        }
        config
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn with_shm_max(mut self, bytes: u64) -> Self {
        self.shm_max = bytes;
        self
    }

    pub fn with_shm_all(mut self, pages: u64) -> Self {
        self.shm_all = pages;
        self
    }

    pub fn with_shm_mni(mut self, segments: u32) -> Self {
        self.shm_mni = segments;
        self
    }

    pub fn with_strict_reattach_size(mut self, strict: bool) -> Self {
        self.strict_reattach_size = strict;
        self
    }

    /// Round `size` up to a whole number of pages, `None` on overflow.
    pub(crate) fn page_round_up(&self, size: u64) -> Option<u64> {
        let mask = self.page_size - 1;
        size.checked_add(mask).map(|s| s & !mask)
    }
}
