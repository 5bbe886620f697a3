use crate::config::{
    Check, Config, DigestType, Direction, DstMode, Forward, Host, KeyType, KvAction,
    KvActionPattern, KvPattern, Protocol, ProtocolType, Redirect, Relay, Rule, RuleAction, Table,
};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_until, take_while},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, value, verify},
    error::VerboseError,
    multi::{many0, many0_count},
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};
use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

type Result<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;
pub(crate) type CResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

enum Section {
    Interval(Duration),
    Timeout(Duration),
    Socket(PathBuf),
    Table(Table),
    Redirect(Redirect),
    Protocol(Protocol),
    Relay(Relay),
}

pub fn config_parser(s: &str) -> Result<Config> {
    all_consuming(terminated(
        map(many0(section), |sections: Vec<Section>| {
            let mut config = Config::default();
            for section in sections {
                match section {
                    Section::Interval(interval) => config.interval = interval,
                    Section::Timeout(timeout) => config.timeout = timeout,
                    Section::Socket(path) => config.socket = path,
                    Section::Table(t) => config.tables.push(t),
                    Section::Redirect(r) => config.redirects.push(r),
                    Section::Protocol(p) => config.protocols.push(p),
                    Section::Relay(r) => config.relays.push(r),
                }
            }
            config
        }),
        skip,
    ))(s)
}

fn section(s: &str) -> Result<Section> {
    alt((
        map(preceded(kw("interval"), number), |n| {
            Section::Interval(Duration::from_secs(n))
        }),
        map(preceded(kw("timeout"), number), |n| {
            Section::Timeout(Duration::from_millis(n))
        }),
        map(preceded(kw("socket"), name), |path| {
            Section::Socket(PathBuf::from(path))
        }),
        map(table, Section::Table),
        map(redirect, Section::Redirect),
        map(protocol, Section::Protocol),
        map(relay, Section::Relay),
    ))(s)
}

//
// Shared token helpers.
//

fn allowed_in_string(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || (ch.is_ascii_punctuation()
            && ch != '('
            && ch != ')'
            && ch != '{'
            && ch != '}'
            && ch != '<'
            && ch != '>'
            && ch != '!'
            && ch != '='
            && ch != '#'
            && ch != ','
            && ch != '"'
            && ch != '/')
}

pub(crate) fn string(s: &str) -> CResult<'_, &str> {
    take_while(allowed_in_string)(s)
}

pub(crate) fn line(s: &str) -> CResult<'_, &str> {
    take_until("\n")(s).and_then(|(s, value)| nl(s).map(|(s, _)| (s, value)))
}

pub(crate) fn quoted(s: &str) -> CResult<'_, &str> {
    alt((delimited(char('\"'), take_until("\""), char('\"')), string))(s)
}

fn nl(s: &str) -> CResult<'_, Option<&str>> {
    map(multispace0, |_| None)(s)
}

pub(crate) fn comment(s: &str) -> CResult<'_, &str> {
    preceded(pair(multispace0, char('#')), line)(s)
}

/// Consume whitespace and comments; matches the empty string, so it
/// must always be followed by something that consumes input.
fn skip(s: &str) -> Result<()> {
    value(
        (),
        many0_count(alt((
            value((), multispace1),
            value((), pair(char('#'), opt(is_not("\n")))),
        ))),
    )(s)
}

/// Like `skip`, but also eats the commas used in host lists.
fn skip_listsep(s: &str) -> Result<()> {
    value(
        (),
        many0_count(alt((
            value((), multispace1),
            value((), char(',')),
            value((), pair(char('#'), opt(is_not("\n")))),
        ))),
    )(s)
}

/// A bare keyword with token boundaries.
fn kw<'a>(word: &'static str) -> impl FnMut(&'a str) -> Result<'a, &'a str> {
    verify(preceded(skip, string), move |token: &str| token == word)
}

/// A quoted or bare non-empty string.
fn name(s: &str) -> Result<&str> {
    verify(preceded(skip, quoted), |token: &str| !token.is_empty())(s)
}

fn number(s: &str) -> Result<u64> {
    map_res(preceded(skip, digit1), str::parse)(s)
}

fn port(s: &str) -> Result<u16> {
    map_res(preceded(skip, digit1), str::parse)(s)
}

fn table_ref(s: &str) -> Result<&str> {
    preceded(skip, delimited(char('<'), string, char('>')))(s)
}

fn ip_addr(s: &str) -> Result<IpAddr> {
    map_res(preceded(skip, string), IpAddr::from_str)(s)
}

fn open_brace(s: &str) -> Result<char> {
    preceded(skip, char('{'))(s)
}

fn close_brace(s: &str) -> Result<char> {
    preceded(skip_listsep, char('}'))(s)
}

//
// Table section.
//

enum TableEntry {
    Check(Check, bool),
    Port(u16),
    Timeout(Duration),
    Interval(Duration),
    Host(Host),
}

fn table(s: &str) -> Result<Table> {
    map(
        tuple((
            kw("table"),
            table_ref,
            opt(kw("disable")),
            open_brace,
            many0(preceded(skip_listsep, table_entry)),
            close_brace,
        )),
        |(_, name, disable, _, entries, _)| {
            let mut table = Table {
                name: name.to_string(),
                disabled: disable.is_some(),
                ..Default::default()
            };
            for entry in entries {
                match entry {
                    TableEntry::Check(check, tls) => {
                        table.check = check;
                        table.tls = tls;
                    }
                    TableEntry::Port(port) => table.port = port,
                    TableEntry::Timeout(timeout) => table.timeout = timeout,
                    TableEntry::Interval(interval) => table.interval = interval,
                    TableEntry::Host(host) => table.hosts.push(host),
                }
            }
            table
        },
    )(s)
}

fn table_entry(s: &str) -> Result<TableEntry> {
    alt((
        map(preceded(kw("check"), check), |(check, tls)| {
            TableEntry::Check(check, tls)
        }),
        map(preceded(kw("port"), port), TableEntry::Port),
        map(preceded(kw("timeout"), number), |n| {
            TableEntry::Timeout(Duration::from_millis(n))
        }),
        map(preceded(kw("interval"), number), |n| {
            TableEntry::Interval(Duration::from_secs(n))
        }),
        map(table_host, TableEntry::Host),
    ))(s)
}

fn check(s: &str) -> Result<(Check, bool)> {
    alt((
        map(kw("icmp"), |_| (Check::Icmp, false)),
        map(kw("tcp"), |_| (Check::Tcp, false)),
        map(kw("ssl"), |_| (Check::Tcp, true)),
        check_http,
        check_send_expect,
        map(preceded(kw("script"), name), |path| {
            (Check::Script { path: PathBuf::from(path) }, false)
        }),
    ))(s)
}

fn check_http(s: &str) -> Result<(Check, bool)> {
    map(
        tuple((
            alt((map(kw("https"), |_| true), map(kw("http"), |_| false))),
            name,
            opt(preceded(kw("host"), name)),
            alt((
                map(preceded(kw("code"), number), |code| (code as u16, None)),
                map_res(preceded(kw("digest"), name), |digest: &str| {
                    let typ = match digest.len() {
                        32 => DigestType::Md5,
                        40 => DigestType::Sha1,
                        _ => return Err("unsupported digest length"),
                    };
                    Ok((0, Some((typ, digest.to_ascii_lowercase()))))
                }),
            )),
        )),
        |(tls, path, host, (code, digest))| {
            let host = host.map(|h| h.to_string());
            let check = match digest {
                None => Check::HttpCode {
                    path: path.to_string(),
                    host,
                    code,
                },
                Some((digest, value)) => Check::HttpDigest {
                    path: path.to_string(),
                    host,
                    digest,
                    value,
                },
            };
            (check, tls)
        },
    )(s)
}

fn check_send_expect(s: &str) -> Result<(Check, bool)> {
    map(
        tuple((
            kw("send"),
            alt((map(kw("nothing"), |_| None), map(name, Some))),
            kw("expect"),
            name,
            opt(kw("tls")),
        )),
        |(_, send, _, expect, tls)| {
            (
                Check::SendExpect {
                    send: send.map(|s| s.to_string()),
                    expect: expect.to_string(),
                },
                tls.is_some(),
            )
        },
    )(s)
}

/// Keywords that may not start a host entry inside a table.
const TABLE_KEYWORDS: &[&str] = &["check", "port", "timeout", "interval"];

fn table_host(s: &str) -> Result<Host> {
    let (s, name) = verify(preceded(skip, string), |token: &str| {
        !token.is_empty() && !TABLE_KEYWORDS.contains(&token)
    })(s)?;

    let mut host = Host {
        name: name.to_string(),
        ..Default::default()
    };
    let (s, opts) = many0(alt((
        map(preceded(kw("retry"), number), HostOpt::Retry),
        map(preceded(kw("parent"), number), HostOpt::Parent),
        map(preceded(kw("priority"), number), HostOpt::Priority),
        map(preceded(pair(kw("ip"), kw("ttl")), number), HostOpt::IpTtl),
    )))(s)?;
    for opt in opts {
        match opt {
            HostOpt::Retry(n) => host.retry = n as usize,
            HostOpt::Parent(n) => host.parent = Some(n as u32),
            HostOpt::Priority(n) => host.priority = Some(n as u8),
            HostOpt::IpTtl(n) => host.ip_ttl = Some(n as u8),
        }
    }
    Ok((s, host))
}

enum HostOpt {
    Retry(u64),
    Parent(u64),
    Priority(u64),
    IpTtl(u64),
}

//
// Redirect section.
//

enum RdrOpt {
    Listen(IpAddr, u16),
    Forward(String),
    Sticky,
    Tag(String),
    Timeout(Duration),
}

fn redirect(s: &str) -> Result<Redirect> {
    map(
        tuple((
            kw("redirect"),
            name,
            open_brace,
            many0(preceded(skip, redirect_option)),
            close_brace,
        )),
        |(_, name, _, opts, _)| {
            let mut rdr = Redirect {
                name: name.to_string(),
                ..Default::default()
            };
            for opt in opts {
                match opt {
                    RdrOpt::Listen(addr, port) => {
                        rdr.listen.push(std::net::SocketAddr::new(addr, port))
                    }
                    RdrOpt::Forward(table) => {
                        if rdr.table.is_empty() {
                            rdr.table = table;
                        } else {
                            rdr.backup = Some(table);
                        }
                    }
                    RdrOpt::Sticky => rdr.sticky = true,
                    RdrOpt::Tag(tag) => rdr.tag = Some(tag),
                    RdrOpt::Timeout(timeout) => rdr.timeout = timeout,
                }
            }
            rdr
        },
    )(s)
}

fn redirect_option(s: &str) -> Result<RdrOpt> {
    alt((
        map(
            tuple((kw("listen"), kw("on"), ip_addr, kw("port"), port)),
            |(_, _, addr, _, port)| RdrOpt::Listen(addr, port),
        ),
        map(preceded(pair(kw("forward"), kw("to")), table_ref), |t| {
            RdrOpt::Forward(t.to_string())
        }),
        map(kw("sticky-address"), |_| RdrOpt::Sticky),
        map(preceded(kw("tag"), name), |t| RdrOpt::Tag(t.to_string())),
        map(preceded(kw("timeout"), number), |n| {
            RdrOpt::Timeout(Duration::from_millis(n))
        }),
    ))(s)
}

//
// Protocol section.
//

enum ProtoEntry {
    Rule(Rule),
    TcpOptions(Vec<String>),
    TlsCa(PathBuf),
}

fn protocol_type(s: &str) -> Result<ProtocolType> {
    alt((
        map(kw("tcp"), |_| ProtocolType::Tcp),
        map(kw("http"), |_| ProtocolType::Http),
    ))(s)
}

fn protocol(s: &str) -> Result<Protocol> {
    map(
        tuple((
            opt(protocol_type),
            kw("protocol"),
            name,
            open_brace,
            many0(preceded(skip, protocol_entry)),
            close_brace,
        )),
        |(typ, _, name, _, entries, _)| {
            let mut proto = Protocol {
                name: name.to_string(),
                typ: typ.unwrap_or_default(),
                ..Default::default()
            };
            for entry in entries {
                match entry {
                    ProtoEntry::Rule(rule) => proto.rules.push(rule),
                    ProtoEntry::TcpOptions(words) => {
                        for word in words {
                            if word == "nodelay" {
                                proto.tcp_nodelay = true;
                            }
                        }
                    }
                    ProtoEntry::TlsCa(path) => proto.tls_ca_path = Some(path),
                }
            }
            proto
        },
    )(s)
}

fn protocol_entry(s: &str) -> Result<ProtoEntry> {
    alt((
        map(rule, ProtoEntry::Rule),
        map(
            preceded(
                kw("tcp"),
                delimited(
                    open_brace,
                    many0(preceded(skip_listsep, verify(string, |t: &str| !t.is_empty()))),
                    close_brace,
                ),
            ),
            |words| ProtoEntry::TcpOptions(words.into_iter().map(str::to_string).collect()),
        ),
        map(
            preceded(tuple((kw("tls"), kw("ca"), kw("file"))), name),
            |path| ProtoEntry::TlsCa(PathBuf::from(path)),
        ),
    ))(s)
}

//
// Rules.
//

enum RuleOpt {
    Method(String),
    Kv(KvPattern),
    Action(KvActionPattern),
    Label(String),
    Tag(String),
    Tagged(String),
    Forward(String, Option<DstMode>),
}

fn rule(s: &str) -> Result<Rule> {
    map(
        tuple((
            alt((
                map(kw("match"), |_| RuleAction::Match),
                map(kw("pass"), |_| RuleAction::Pass),
                map(kw("block"), |_| RuleAction::Block),
            )),
            opt(alt((
                map(kw("request"), |_| Direction::Request),
                map(kw("response"), |_| Direction::Response),
            ))),
            many0(rule_option),
        )),
        |(action, dir, opts)| {
            let mut rule = Rule {
                action,
                dir: dir.unwrap_or_default(),
                ..Default::default()
            };
            for opt in opts {
                match opt {
                    RuleOpt::Method(m) => rule.method = Some(m),
                    RuleOpt::Kv(kv) => rule.kv.push(kv),
                    RuleOpt::Action(action) => rule.actions.push(action),
                    RuleOpt::Label(l) => rule.label = Some(l),
                    RuleOpt::Tag(t) => rule.tag = Some(t),
                    RuleOpt::Tagged(t) => rule.tagged = Some(t),
                    RuleOpt::Forward(table, mode) => {
                        rule.table = Some(table);
                        rule.table_mode = mode.unwrap_or_default();
                    }
                }
            }
            rule
        },
    )(s)
}

fn key_type(s: &str) -> Result<KeyType> {
    alt((
        map(kw("cookie"), |_| KeyType::Cookie),
        map(kw("header"), |_| KeyType::Header),
        map(kw("path"), |_| KeyType::Path),
        map(kw("query"), |_| KeyType::Query),
        map(kw("url"), |_| KeyType::Url),
    ))(s)
}

fn dst_mode(s: &str) -> Result<DstMode> {
    alt((
        map(kw("roundrobin"), |_| DstMode::RoundRobin),
        map(kw("loadbalance"), |_| DstMode::LoadBalance),
        map(kw("source-hash"), |_| DstMode::SrcHash),
        map(kw("hash"), |_| DstMode::Hash),
        map(kw("random"), |_| DstMode::Random),
    ))(s)
}

fn rule_option(s: &str) -> Result<RuleOpt> {
    alt((
        map(preceded(kw("method"), name), |m| {
            RuleOpt::Method(m.to_ascii_uppercase())
        }),
        map(
            tuple((
                alt((
                    map(kw("append"), |_| KvAction::Append),
                    map(kw("set"), |_| KvAction::Set),
                )),
                key_type,
                name,
                name,
            )),
            |(action, typ, key, value)| {
                RuleOpt::Action(KvActionPattern {
                    action,
                    typ,
                    key: key.to_string(),
                    value: Some(value.to_string()),
                })
            },
        ),
        map(
            tuple((
                alt((
                    map(kw("remove"), |_| KvAction::Remove),
                    map(kw("hash"), |_| KvAction::Hash),
                    map(kw("log"), |_| KvAction::Log),
                )),
                key_type,
                name,
            )),
            |(action, typ, key)| {
                RuleOpt::Action(KvActionPattern {
                    action,
                    typ,
                    key: key.to_string(),
                    value: None,
                })
            },
        ),
        map(
            tuple((key_type, name, opt(preceded(kw("value"), name)))),
            |(typ, key, value)| {
                RuleOpt::Kv(KvPattern {
                    typ,
                    key: key.to_string(),
                    value: value.map(|v| v.to_string()),
                })
            },
        ),
        map(preceded(kw("label"), name), |l| {
            RuleOpt::Label(l.to_string())
        }),
        map(preceded(kw("tagged"), name), |t| {
            RuleOpt::Tagged(t.to_string())
        }),
        map(preceded(kw("tag"), name), |t| RuleOpt::Tag(t.to_string())),
        map(
            tuple((
                kw("forward"),
                kw("to"),
                table_ref,
                opt(preceded(kw("mode"), dst_mode)),
            )),
            |(_, _, table, mode)| RuleOpt::Forward(table.to_string(), mode),
        ),
    ))(s)
}

//
// Relay section.
//

enum RelayOpt {
    Listen {
        addr: IpAddr,
        port: u16,
        tls: bool,
        inspect: bool,
        udp: bool,
    },
    Protocol(String),
    Forward(Forward),
    Timeout(Duration),
    Limit(usize),
    Transparent,
    Cert(PathBuf),
    Key(PathBuf),
    CaCert(PathBuf),
    CaKey(PathBuf),
}

fn relay(s: &str) -> Result<Relay> {
    map(
        tuple((
            kw("relay"),
            name,
            open_brace,
            many0(preceded(skip, relay_option)),
            close_brace,
        )),
        |(_, name, _, opts, _)| {
            let mut relay = Relay {
                name: name.to_string(),
                ..Default::default()
            };
            for opt in opts {
                match opt {
                    RelayOpt::Listen {
                        addr,
                        port,
                        tls,
                        inspect,
                        udp,
                    } => {
                        relay.listen = std::net::SocketAddr::new(addr, port);
                        relay.flags.ssl = tls;
                        relay.flags.ssl_inspect = inspect;
                        relay.flags.udp = udp;
                    }
                    RelayOpt::Protocol(p) => relay.protocol = Some(p),
                    RelayOpt::Forward(fwd) => {
                        if fwd.tls {
                            relay.flags.ssl_client = true;
                        }
                        relay.forward.push(fwd);
                    }
                    RelayOpt::Timeout(timeout) => relay.timeout = timeout,
                    RelayOpt::Limit(limit) => relay.session_limit = limit,
                    RelayOpt::Transparent => relay.flags.needpf = true,
                    RelayOpt::Cert(path) => relay.cert_path = Some(path),
                    RelayOpt::Key(path) => relay.key_path = Some(path),
                    RelayOpt::CaCert(path) => relay.ca_cert_path = Some(path),
                    RelayOpt::CaKey(path) => relay.ca_key_path = Some(path),
                }
            }
            relay
        },
    )(s)
}

fn relay_option(s: &str) -> Result<RelayOpt> {
    alt((
        map(
            tuple((
                kw("listen"),
                kw("on"),
                ip_addr,
                kw("port"),
                port,
                opt(pair(kw("tls"), opt(kw("inspect")))),
                opt(kw("udp")),
            )),
            |(_, _, addr, _, port, tls, udp)| RelayOpt::Listen {
                addr,
                port,
                tls: tls.is_some(),
                inspect: matches!(tls, Some((_, Some(_)))),
                udp: udp.is_some(),
            },
        ),
        map(preceded(kw("protocol"), name), |p| {
            RelayOpt::Protocol(p.to_string())
        }),
        map(
            tuple((
                kw("forward"),
                opt(pair(kw("with"), kw("tls"))),
                kw("to"),
                table_ref,
                opt(preceded(kw("port"), port)),
                opt(preceded(kw("mode"), dst_mode)),
            )),
            |(_, tls, _, table, port, mode)| {
                RelayOpt::Forward(Forward {
                    table: table.to_string(),
                    port: port.unwrap_or(0),
                    mode: mode.unwrap_or_default(),
                    tls: tls.is_some(),
                    ..Default::default()
                })
            },
        ),
        map(
            preceded(pair(kw("session"), kw("timeout")), number),
            |n| RelayOpt::Timeout(Duration::from_secs(n)),
        ),
        map(preceded(pair(kw("session"), kw("limit")), number), |n| {
            RelayOpt::Limit(n as usize)
        }),
        map(kw("transparent"), |_| RelayOpt::Transparent),
        map(
            preceded(pair(kw("ca"), kw("certificate")), name),
            |path| RelayOpt::CaCert(PathBuf::from(path)),
        ),
        map(preceded(pair(kw("ca"), kw("key")), name), |path| {
            RelayOpt::CaKey(PathBuf::from(path))
        }),
        map(preceded(kw("certificate"), name), |path| {
            RelayOpt::Cert(PathBuf::from(path))
        }),
        map(preceded(kw("key"), name), |path| {
            RelayOpt::Key(PathBuf::from(path))
        }),
    ))(s)
}

#[allow(unused)]
fn variable(s: &str) -> Result<crate::config::Variable> {
    map(separated_pair(string, char('='), quoted), |(key, value)| {
        crate::config::Variable::from((key.to_string(), value.to_string()))
    })(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::Finish;

    fn parse(input: &str) -> Config {
        match config_parser(input).finish() {
            Ok((_, config)) => config,
            Err(err) => panic!("{}", nom::error::convert_error(input, err)),
        }
    }

    #[test]
    fn test_global_options() {
        let config = parse("interval 30\ntimeout 1000\nsocket \"/tmp/relayd.sock\"\n");
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_millis(1000));
        assert_eq!(config.socket, PathBuf::from("/tmp/relayd.sock"));
    }

    #[test]
    fn test_table_with_hosts() {
        let config = parse(
            "table <webhosts> {\n\
             \tcheck tcp port 80 timeout 500\n\
             \t10.0.0.1, 10.0.0.2 retry 2\n\
             \twww.example.com priority 1\n\
             }\n",
        );
        let table = &config.tables[0];
        assert_eq!(table.name, "webhosts");
        assert_eq!(table.check, Check::Tcp);
        assert_eq!(table.port, 80);
        assert_eq!(table.timeout, Duration::from_millis(500));
        assert_eq!(table.hosts.len(), 3);
        assert_eq!(table.hosts[1].retry, 2);
        assert_eq!(table.hosts[2].priority, Some(1));
    }

    #[test]
    fn test_table_checks() {
        let config = parse(
            "table <a> { check http \"/index.html\" code 200 10.0.0.1 }\n\
             table <b> { check http \"/\" digest \"8f434346648f6b96df89dda901c5176b10a6d839\" 10.0.0.1 }\n\
             table <c> { check send \"HELO\" expect \"250*\" 10.0.0.1 }\n\
             table <d> { check script \"/usr/local/bin/check.sh\" 10.0.0.1 }\n\
             table <e> { check https \"/\" code 200 10.0.0.1 }\n",
        );
        assert!(matches!(config.tables[0].check, Check::HttpCode { code: 200, .. }));
        assert!(matches!(
            config.tables[1].check,
            Check::HttpDigest {
                digest: DigestType::Sha1,
                ..
            }
        ));
        assert!(matches!(config.tables[2].check, Check::SendExpect { .. }));
        assert!(matches!(config.tables[3].check, Check::Script { .. }));
        assert!(config.tables[4].tls);
    }

    #[test]
    fn test_redirect() {
        let config = parse(
            "redirect \"www\" {\n\
             \tlisten on 0.0.0.0 port 80\n\
             \tforward to <webhosts>\n\
             \tforward to <fallback>\n\
             \tsticky-address\n\
             \ttag \"www\"\n\
             }\n",
        );
        let rdr = &config.redirects[0];
        assert_eq!(rdr.name, "www");
        assert_eq!(rdr.table, "webhosts");
        assert_eq!(rdr.backup.as_deref(), Some("fallback"));
        assert!(rdr.sticky);
        assert_eq!(rdr.listen.len(), 1);
    }

    #[test]
    fn test_protocol_rules() {
        let config = parse(
            "http protocol \"httpfilter\" {\n\
             \tmatch request header \"Host\" value \"*.example.com\" \
             set header \"X-Original-Host\" \"$HEADER\"\n\
             \tmatch request hash query \"sessid\"\n\
             \tblock request path \"/admin*\" label \"denied\"\n\
             \tpass response header \"Content-Type\"\n\
             \ttcp { nodelay }\n\
             }\n",
        );
        let proto = &config.protocols[0];
        assert_eq!(proto.typ, ProtocolType::Http);
        assert!(proto.tcp_nodelay);
        assert_eq!(proto.rules.len(), 4);

        let rule = &proto.rules[0];
        assert_eq!(rule.action, RuleAction::Match);
        assert_eq!(rule.dir, Direction::Request);
        assert_eq!(rule.kv.len(), 1);
        assert_eq!(rule.kv[0].typ, KeyType::Header);
        assert_eq!(rule.kv[0].key, "Host");
        assert_eq!(rule.kv[0].value.as_deref(), Some("*.example.com"));
        assert_eq!(rule.actions.len(), 1);
        assert_eq!(rule.actions[0].action, KvAction::Set);
        assert_eq!(rule.actions[0].key, "X-Original-Host");

        let hash = &config.protocols[0].rules[1];
        assert_eq!(hash.actions[0].action, KvAction::Hash);
        assert_eq!(hash.actions[0].typ, KeyType::Query);

        let block = &proto.rules[2];
        assert_eq!(block.action, RuleAction::Block);
        assert_eq!(block.label.as_deref(), Some("denied"));
        assert!(block.kv[0].globbing());
    }

    #[test]
    fn test_relay() {
        let config = parse(
            "relay \"wwwtls\" {\n\
             \tlisten on 127.0.0.1 port 443 tls\n\
             \tprotocol \"httpfilter\"\n\
             \tcertificate \"/etc/ssl/www.crt\"\n\
             \tkey \"/etc/ssl/private/www.key\"\n\
             \tforward to <webhosts> port 8080 mode roundrobin\n\
             \tsession timeout 60\n\
             }\n",
        );
        let relay = &config.relays[0];
        assert_eq!(relay.name, "wwwtls");
        assert!(relay.flags.ssl);
        assert!(!relay.flags.ssl_inspect);
        assert_eq!(relay.listen.port(), 443);
        assert_eq!(relay.forward[0].port, 8080);
        assert_eq!(relay.forward[0].mode, DstMode::RoundRobin);
        assert_eq!(relay.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_relay_udp_and_forward_tls() {
        let config = parse(
            "relay \"dns\" {\n\
             \tlisten on 127.0.0.1 port 53 udp\n\
             \tforward to <dnshosts>\n\
             }\n\
             relay \"backends\" {\n\
             \tlisten on 127.0.0.1 port 8443\n\
             \tforward with tls to <securehosts>\n\
             }\n",
        );
        assert!(config.relays[0].flags.udp);
        assert!(config.relays[1].flags.ssl_client);
        assert!(config.relays[1].forward[0].tls);
    }

    #[test]
    fn test_comments_and_macros_ignored() {
        let config = parse(
            "# leading comment\n\
             interval 5 # trailing comment\n\
             table <t> { 10.0.0.1 } # done\n",
        );
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.tables.len(), 1);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(config_parser("not a config\n").finish().is_err());
        assert!(config_parser("table <x> { \n").finish().is_err());
    }
}
