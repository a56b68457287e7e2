use super::ConfigError;

/// Constructor validation lifecycle shared by kernel structs.
pub trait KernelLifecycle: Sized {
    /// Kernel config type.
    type Config;

    /// Construct a validated kernel from config.
    fn try_new(config: Self::Config) -> Result<Self, ConfigError>;
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, KernelLifecycle};

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct DownsampleConfig {
        bin_num: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Downsample {
        bin_num: usize,
    }

    impl KernelLifecycle for Downsample {
        type Config = DownsampleConfig;

        fn try_new(config: Self::Config) -> Result<Self, ConfigError> {
            if config.bin_num == 0 {
                return Err(ConfigError::InvalidArgument {
                    arg: "bin_num",
                    reason: "bin_num must be greater than zero",
                });
            }
            Ok(Self {
                bin_num: config.bin_num,
            })
        }
    }

    #[test]
    fn lifecycle_constructor_accepts_valid_config() {
        let kernel = Downsample::try_new(DownsampleConfig { bin_num: 4 }).expect("valid config");
        assert_eq!(kernel.bin_num, 4);
    }

    #[test]
    fn lifecycle_constructor_rejects_invalid_config() {
        let err = Downsample::try_new(DownsampleConfig { bin_num: 0 }).expect_err("invalid config");
        assert_eq!(
            err,
            ConfigError::InvalidArgument {
                arg: "bin_num",
                reason: "bin_num must be greater than zero",
            }
        );
        assert_eq!(
            err.to_string(),
            "Invalid argument `bin_num`: bin_num must be greater than zero"
        );
    }
}
