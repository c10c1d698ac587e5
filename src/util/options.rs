//! Environment-variable configuration, parsed once at heap init and
//! immutable for the process lifetime.

use crate::util::constants::*;
use std::fmt;
use std::str::FromStr;

/// A byte size parsed from a string with an optional `k`/`m`/`g` suffix,
/// e.g. `64m` or `1G`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapSize(pub usize);

impl FromStr for HeapSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, multiplier) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], 1usize << LOG_BYTES_IN_KBYTE),
            Some('m') | Some('M') => (&s[..s.len() - 1], 1usize << LOG_BYTES_IN_MBYTE),
            Some('g') | Some('G') => (&s[..s.len() - 1], 1usize << 30),
            _ => (s, 1),
        };
        let value: usize = digits
            .trim()
            .parse()
            .map_err(|_| format!("Invalid size: {}", s))?;
        Ok(HeapSize(value * multiplier))
    }
}

impl fmt::Display for HeapSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with REGIONGC_ and match any option (such as
                // REGIONGC_MAX_HEAP_SIZE), we set the option to its value (if it is a valid
                // value). Otherwise, use the default value.
                const PREFIX: &str = "REGIONGC_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // The initial heap size. The heap starts at this size and only grows.
    min_heap_size:   HeapSize [|v: &HeapSize| v.0 >= MIN_HEAP_SIZE] = HeapSize(64 << LOG_BYTES_IN_MBYTE),
    // The maximum heap size. The address range for this size is reserved up front.
    max_heap_size:   HeapSize [|v: &HeapSize| v.0 >= MIN_HEAP_SIZE] = HeapSize(1024 << LOG_BYTES_IN_MBYTE),
    // Number of GC worker threads.
    threads:         usize    [|v: &usize| *v > 0] = num_cpus::get(),
    // Grow the heap when the fraction of cycle time spent marking exceeds this ratio.
    mark_time_ratio: f32      [|v: &f32| *v > 0.0 && *v < 1.0] = 0.05,
    // Grow the heap when the free-block fraction after sweep drops below this ratio.
    min_free_ratio:  f32      [|v: &f32| *v > 0.0 && *v < 1.0] = 0.2,
    // Path for the CSV phase-event trace. Statistics collection is off when empty.
    stats_file:      String   [always_valid] = String::new(),
}

impl Options {
    /// Check the hard configuration invariants that cannot be repaired by
    /// falling back to a default. Violations are fatal at heap init.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_heap_size.0 < MIN_HEAP_SIZE {
            return Err(format!(
                "min heap size {} is below the supported minimum {}",
                self.min_heap_size, MIN_HEAP_SIZE
            ));
        }
        if self.max_heap_size.0 < self.min_heap_size.0 {
            return Err(format!(
                "max heap size {} is below min heap size {}",
                self.max_heap_size, self.min_heap_size
            ));
        }
        // Free chunks are referenced by 32-bit granule index.
        const MAX_ADDRESSABLE: usize = (u32::MAX as usize) << LOG_ALLOCATION_ALIGNMENT;
        if self.max_heap_size.0 > MAX_ADDRESSABLE {
            return Err(format!(
                "max heap size {} exceeds the supported maximum {}",
                self.max_heap_size, MAX_ADDRESSABLE
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn parse_heap_size_suffixes() {
        assert_eq!("4096".parse::<HeapSize>().unwrap(), HeapSize(4096));
        assert_eq!("64k".parse::<HeapSize>().unwrap(), HeapSize(64 * 1024));
        assert_eq!("64m".parse::<HeapSize>().unwrap(), HeapSize(64 << 20));
        assert_eq!("1G".parse::<HeapSize>().unwrap(), HeapSize(1 << 30));
        assert!("64q".parse::<HeapSize>().is_err());
        assert!("".parse::<HeapSize>().is_err());
    }

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.min_heap_size, HeapSize(64 << 20));
            assert!(options.stats_file.is_empty());
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("REGIONGC_MIN_HEAP_SIZE", "128m");
                    std::env::set_var("REGIONGC_THREADS", "3");

                    let options = Options::default();
                    assert_eq!(options.min_heap_size, HeapSize(128 << 20));
                    assert_eq!(options.threads, 3);
                },
                || {
                    std::env::remove_var("REGIONGC_MIN_HEAP_SIZE");
                    std::env::remove_var("REGIONGC_THREADS");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // We cannot parse the value, so use the default value.
                    std::env::set_var("REGIONGC_THREADS", "abc");

                    let options = Options::default();
                    assert_eq!(options.threads, num_cpus::get());
                },
                || {
                    std::env::remove_var("REGIONGC_THREADS");
                },
            )
        })
    }

    #[test]
    fn with_rejected_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // Zero threads fails validation, so use the default value.
                    std::env::set_var("REGIONGC_THREADS", "0");
                    std::env::set_var("REGIONGC_MARK_TIME_RATIO", "7.0");

                    let options = Options::default();
                    assert_eq!(options.threads, num_cpus::get());
                    assert_eq!(options.mark_time_ratio, 0.05);
                },
                || {
                    std::env::remove_var("REGIONGC_THREADS");
                    std::env::remove_var("REGIONGC_MARK_TIME_RATIO");
                },
            )
        })
    }

    #[test]
    fn validate_size_ordering() {
        let mut options = Options::default();
        options.min_heap_size = HeapSize(256 << 20);
        options.max_heap_size = HeapSize(64 << 20);
        assert!(options.validate().is_err());

        options.max_heap_size = HeapSize(256 << 20);
        assert!(options.validate().is_ok());
    }
}
