//! Command-name and pattern tables backing the policy engine.
//!
//! The allowed sets are nested by construction: the MEDIUM set is LOW plus
//! `MEDIUM_EXTRA`, the HIGH set is MEDIUM plus `HIGH_EXTRA`. Names in
//! `ALWAYS_DENIED` are rejected at every tier and must never appear in any
//! allowed table.

/// Read-only diagnostics and inspection. Admitted at every tier.
pub const LOW_COMMANDS: &[&str] = &[
    // File inspection
    "ls", "cat", "head", "tail", "less", "more", "grep", "egrep", "fgrep", "rg", "find",
    "locate", "file", "stat", "readlink", "basename", "dirname", "du", "df", "wc", "diff",
    "cmp", "comm", "column",
    // Checksums and encodings
    "md5sum", "sha1sum", "sha256sum", "sha512sum", "cksum", "base64", "xxd", "hexdump", "od",
    "strings",
    // System identity and state
    "pwd", "echo", "printf", "date", "cal", "uptime", "whoami", "id", "groups", "who", "w",
    "last", "hostname", "uname", "arch", "nproc", "locale", "env", "printenv", "which",
    "whereis",
    // Hardware and resource inspection
    "free", "vmstat", "iostat", "mpstat", "lscpu", "lsmem", "lsblk", "lsof", "lspci",
    "lsusb", "lsmod", "dmesg",
    // Processes
    "ps", "top", "pgrep", "pidof",
    // Network inspection
    "ping", "traceroute", "tracepath", "dig", "nslookup", "host", "ss", "netstat", "ip",
    "arp",
    // Structured output
    "jq",
    // Shell trivia
    "true", "false", "test", "sleep", "time",
];

/// Safe mutation, dev tooling, and service observation. Added at MEDIUM.
pub const MEDIUM_EXTRA: &[&str] = &[
    // File manipulation
    "cp", "mv", "rm", "rmdir", "mkdir", "touch", "ln", "tee", "truncate",
    // Text processing that can rewrite files
    "awk", "sed", "sort", "uniq", "cut", "tr", "xargs",
    // Archives
    "tar", "gzip", "gunzip", "zip", "unzip", "bzip2", "bunzip2", "xz", "unxz", "zcat",
    "zstd",
    // Process control
    "kill", "killall", "pkill", "nice", "renice", "ionice", "nohup", "timeout", "watch",
    // Network clients
    "curl", "wget", "ssh", "scp", "sftp", "rsync",
    // Version control
    "git",
    // Containers and orchestration
    "docker", "docker-compose", "podman", "kubectl", "helm", "k9s",
    // Services and logs
    "systemctl", "journalctl", "service",
    // Terminal multiplexers
    "screen", "tmux",
    // Database clients
    "psql", "mysql", "redis-cli", "sqlite3",
];

/// Administrative surface, gated to HIGH (the only tier where sudo passes).
pub const HIGH_EXTRA: &[&str] = &[
    // Package management
    "apt", "apt-get", "apt-cache", "dpkg", "yum", "dnf", "rpm", "pacman", "zypper", "snap",
    "brew", "pip", "pip3", "npm", "npx", "yarn", "gem",
    // Build toolchains and interpreters
    "make", "cmake", "gcc", "g++", "cc", "cargo", "go", "python", "python3", "perl", "ruby",
    "node", "bash", "sh", "zsh",
    // Ownership and permissions
    "chmod", "chown", "chgrp", "chattr", "setfacl", "getfacl",
    // Mounts and filesystems
    "mount", "umount", "swapon", "swapoff", "losetup", "blkid", "fsck", "tune2fs",
    // Kernel and networking control
    "sysctl", "modprobe", "insmod", "rmmod", "depmod", "iptables", "ip6tables", "nft",
    "ufw", "firewall-cmd", "tc", "ethtool",
    // System management
    "systemd-analyze", "loginctl", "timedatectl", "localectl", "hostnamectl",
    "update-alternatives", "ldconfig", "crontab", "at",
    // Tunnels and key material
    "tailscale", "tailscaled", "cloudflared", "wg", "wg-quick", "openssl", "ssh-keygen",
    "ssh-copy-id", "certbot",
    // Raw sockets and diagnostics
    "nc", "netcat", "ncat", "socat", "telnet", "nmap", "tcpdump", "iftop", "iotop",
    "strace", "ltrace", "gdb", "perf",
];

/// Rejected at every tier, sudo or not. Disjoint from every allowed table.
pub const ALWAYS_DENIED: &[&str] = &[
    // Disk destruction
    "dd", "mkfs", "fdisk", "parted", "shred", "wipefs", "blkdiscard", "sgdisk", "sfdisk",
    "mkswap",
    // Machine state
    "shutdown", "reboot", "halt", "poweroff", "init", "telinit", "kexec",
    // Account manipulation
    "passwd", "useradd", "userdel", "usermod", "groupadd", "groupdel", "groupmod",
    "chpasswd", "vipw", "visudo",
    // Identity switching and container escape
    "su", "chroot", "pivot_root", "nsenter", "unshare",
    // Device nodes
    "mknod",
];

/// A forbidden pattern: regex source plus the label used in deny reasons.
pub struct PatternSpec {
    pub source: &'static str,
    pub label: &'static str,
}

/// Patterns denied at every tier, matched against the full command string.
pub const ALWAYS_FORBIDDEN_PATTERNS: &[PatternSpec] = &[
    PatternSpec {
        source: r"\brm\s+(-[a-zA-Z]+\s+)*/(\s|$|\*)",
        label: "recursive delete of the filesystem root",
    },
    PatternSpec {
        source: r"\bdd\s+if=.*\bof=/dev/",
        label: "raw write to a block device",
    },
    PatternSpec {
        source: r"\bmkfs(\.|\s|$)",
        label: "filesystem creation",
    },
    PatternSpec {
        source: r":\(\)\s*\{",
        label: "fork bomb",
    },
    PatternSpec {
        source: r">\s*/dev/(sd[a-z]|nvme|hd[a-z])",
        label: "redirection onto a block device",
    },
    PatternSpec {
        source: r"\bchmod\s+(-[a-zA-Z]+\s+)*777\s+/(\s|$)",
        label: "world-writable permissions on the filesystem root",
    },
    PatternSpec {
        source: r"\b(curl|wget)\b[^|]*\|\s*(ba|z)?sh\b",
        label: "piping a download into a shell",
    },
];

/// Patterns denied at LOW: all chaining, redirection, substitution, and any
/// occurrence of sudo.
pub const LOW_FORBIDDEN_PATTERNS: &[PatternSpec] = &[
    PatternSpec {
        source: r"&&",
        label: "command chaining",
    },
    PatternSpec {
        source: r"\|\|",
        label: "command chaining",
    },
    PatternSpec {
        source: r";",
        label: "command sequencing",
    },
    PatternSpec {
        source: r"\|",
        label: "pipelines",
    },
    PatternSpec {
        source: r"`",
        label: "command substitution",
    },
    PatternSpec {
        source: r"\$\(",
        label: "command substitution",
    },
    PatternSpec {
        source: r">>",
        label: "output redirection",
    },
    PatternSpec {
        source: r">",
        label: "output redirection",
    },
    PatternSpec {
        source: r"<",
        label: "input redirection",
    },
    PatternSpec {
        source: r"\bsudo\b",
        label: "privilege escalation",
    },
];

/// Patterns denied at MEDIUM: LOW's set minus the single pipe, which is
/// instead validated segment-by-segment against the MEDIUM allowed set.
pub const MEDIUM_FORBIDDEN_PATTERNS: &[PatternSpec] = &[
    PatternSpec {
        source: r"&&",
        label: "command chaining",
    },
    PatternSpec {
        source: r"\|\|",
        label: "command chaining",
    },
    PatternSpec {
        source: r";",
        label: "command sequencing",
    },
    PatternSpec {
        source: r"`",
        label: "command substitution",
    },
    PatternSpec {
        source: r"\$\(",
        label: "command substitution",
    },
    PatternSpec {
        source: r">>",
        label: "output redirection",
    },
    PatternSpec {
        source: r">",
        label: "output redirection",
    },
    PatternSpec {
        source: r"<",
        label: "input redirection",
    },
    PatternSpec {
        source: r"\bsudo\b",
        label: "privilege escalation",
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_always_denied_disjoint_from_allowed() {
        let denied: HashSet<&str> = ALWAYS_DENIED.iter().copied().collect();
        for name in LOW_COMMANDS.iter().chain(MEDIUM_EXTRA).chain(HIGH_EXTRA) {
            assert!(
                !denied.contains(name),
                "'{name}' appears in both an allowed table and ALWAYS_DENIED"
            );
        }
    }

    #[test]
    fn test_tables_have_no_duplicates() {
        let mut seen = HashSet::new();
        for name in LOW_COMMANDS
            .iter()
            .chain(MEDIUM_EXTRA)
            .chain(HIGH_EXTRA)
            .chain(ALWAYS_DENIED)
        {
            assert!(seen.insert(*name), "'{name}' listed twice");
        }
    }

    #[test]
    fn test_table_breadth() {
        let total = LOW_COMMANDS.len() + MEDIUM_EXTRA.len() + HIGH_EXTRA.len()
            + ALWAYS_DENIED.len();
        assert!(total >= 220, "expected at least 220 command names, got {total}");
    }

    #[test]
    fn test_all_pattern_sources_compile() {
        for spec in ALWAYS_FORBIDDEN_PATTERNS
            .iter()
            .chain(LOW_FORBIDDEN_PATTERNS)
            .chain(MEDIUM_FORBIDDEN_PATTERNS)
        {
            assert!(
                regex::Regex::new(spec.source).is_ok(),
                "pattern '{}' does not compile",
                spec.source
            );
        }
    }
}
