#[cfg(test)]
mod tests {
    use crate::listeners::{parse_listen_addr, Network};

    /// Test plain TCP address forms.
    #[test]
    fn test_parse_tcp() {
        let a = parse_listen_addr(":8080").unwrap();
        assert_eq!(a.network, Network::Tcp);
        assert_eq!(a.host, "");
        assert_eq!((a.start_port, a.end_port), (8080, 8080));

        let a = parse_listen_addr("127.0.0.1:9000").unwrap();
        assert_eq!(a.host, "127.0.0.1");
        assert_eq!(a.start_port, 9000);
    }

    /// Test port ranges expand to one spec per port.
    #[test]
    fn test_parse_port_range() {
        let a = parse_listen_addr(":8080-8082").unwrap();
        let specs = a.expand();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].address, "0.0.0.0:8080");
        assert_eq!(specs[2].address, "0.0.0.0:8082");
        assert_eq!(specs[0].key(), "tcp/0.0.0.0:8080");
    }

    /// Test unix and fd forms.
    #[test]
    fn test_parse_unix_and_fd() {
        let a = parse_listen_addr("unix//run/trellis.sock").unwrap();
        assert_eq!(a.network, Network::Unix);
        assert_eq!(a.path, "/run/trellis.sock");

        let a = parse_listen_addr("fd/3").unwrap();
        assert_eq!(a.network, Network::Fd);
        assert_eq!(a.path, "3");
    }

    /// Test malformed addresses are rejected.
    #[test]
    fn test_parse_errors() {
        assert!(parse_listen_addr("no-port").is_err());
        assert!(parse_listen_addr(":eighty").is_err());
        assert!(parse_listen_addr(":9000-8000").is_err());
        assert!(parse_listen_addr("unix/").is_err());
        assert!(parse_listen_addr("fd/x").is_err());
    }
}
