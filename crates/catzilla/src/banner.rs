// src/banner.rs
use crate::config::{Config, Mode};

/// Everything the banner reports, gathered after the allocator facade
/// has made its backend decision so the output never lies.
pub struct BannerInfo<'a> {
    pub bind_addr: &'a str,
    pub workers: usize,
    pub allocator_backend: &'a str,
    pub cache_l1: bool,
    pub cache_l2: bool,
    pub static_mounts: usize,
}

fn cache_tiers(info: &BannerInfo<'_>) -> &'static str {
    match (info.cache_l1, info.cache_l2) {
        (true, true) => "L1+L2",
        (true, false) => "L1",
        (false, true) => "L2",
        (false, false) => "off",
    }
}

/// One-shot startup banner. Development gets the verbose box, production
/// a single compact line.
pub fn print_banner(config: &Config, info: &BannerInfo<'_>) {
    let version = env!("CARGO_PKG_VERSION");
    if config.mode == Mode::Production {
        println!(
            "catzilla v{} listening on http://{} (workers={} allocator={} cache={} mounts={})",
            version,
            info.bind_addr,
            info.workers,
            info.allocator_backend,
            cache_tiers(info),
            info.static_mounts,
        );
        return;
    }

    println!("┌─────────────────────────────────────────────┐");
    println!("│  Catzilla v{version:<10}                 🦖      │");
    println!("└─────────────────────────────────────────────┘");
    println!("  listening   http://{}", info.bind_addr);
    println!("  workers     {}", info.workers);
    println!("  allocator   {}", info.allocator_backend);
    println!("  cache       {}", cache_tiers(info));
    println!("  mounts      {}", info.static_mounts);
    println!("  pid         {}", std::process::id());
    println!("  mode        development (set ENVIRONMENT=production to quiet this)");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_label_reflects_enabled_layers() {
        let mut info = BannerInfo {
            bind_addr: "127.0.0.1:8000",
            workers: 4,
            allocator_backend: "system",
            cache_l1: true,
            cache_l2: false,
            static_mounts: 0,
        };
        assert_eq!(cache_tiers(&info), "L1");
        info.cache_l2 = true;
        assert_eq!(cache_tiers(&info), "L1+L2");
        info.cache_l1 = false;
        info.cache_l2 = false;
        assert_eq!(cache_tiers(&info), "off");
    }
}
