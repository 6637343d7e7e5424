//! Cache geometry, as reported by cpuid leaf 4.
//! Used to pick a default associativity when none is given on the command line.
use raw_cpuid::CpuId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheType {
    Data = 1,
    Instruction = 2,
    Unified = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub cache_type: CacheType,
    pub level: u8,
    pub ways: usize,
    pub sets: usize,
    pub line_size: usize,
}

impl CacheInfo {
    pub fn size(&self) -> usize {
        self.ways * self.sets * self.line_size
    }
}

pub fn get_cache_info() -> Vec<CacheInfo> {
    let cpuid = CpuId::new();
    let mut ret = Vec::new();
    if let Some(parameters) = cpuid.get_cache_parameters() {
        for p in parameters {
            let cache_type = match p.cache_type() {
                raw_cpuid::CacheType::Data => CacheType::Data,
                raw_cpuid::CacheType::Instruction => CacheType::Instruction,
                raw_cpuid::CacheType::Unified => CacheType::Unified,
                _ => continue,
            };
            ret.push(CacheInfo {
                cache_type,
                level: p.level(),
                ways: p.associativity(),
                sets: p.sets(),
                line_size: p.coherency_line_size(),
            });
        }
    }
    ret
}

pub fn last_level_cache() -> Option<CacheInfo> {
    get_cache_info()
        .into_iter()
        .filter(|c| c.cache_type != CacheType::Instruction)
        .max_by_key(|c| c.level)
}
