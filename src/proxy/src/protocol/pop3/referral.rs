use crate::server::{is_valid_dns_name, RedirectTarget};

use percent_encoding::percent_decode_str;
use std::net::{Ipv4Addr, Ipv6Addr};
use winnow::ascii::digit1;
use winnow::combinator::{alt, delimited, opt, preceded, terminated};
use winnow::token::take_while;
use winnow::{PResult, Parser};

fn is_userinfo_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '.'
                | '_'
                | '~'
                | '%'
                | '!'
                | '$'
                | '&'
                | '\''
                | '('
                | ')'
                | '*'
                | '+'
                | ','
                | ';'
                | '='
                | ':'
        )
}

fn is_reg_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.')
}

fn is_ip6_char(c: char) -> bool {
    c.is_ascii_hexdigit() || c == ':' || c == '.'
}

/// URI authority: `[userinfo@]host[:port]` with the host an IP4 literal, a
/// bracketed IP6 literal or a DNS name.
fn authority(input: &mut &str) -> PResult<RedirectTarget> {
    let user = opt(terminated(take_while(1.., is_userinfo_char), '@')).parse_next(input)?;
    let host = alt((
        delimited('[', take_while(1.., is_ip6_char), ']')
            .verify(|h: &str| h.parse::<Ipv6Addr>().is_ok()),
        take_while(1.., is_reg_name_char)
            .verify(|h: &str| h.parse::<Ipv4Addr>().is_ok() || is_valid_dns_name(h)),
    ))
    .parse_next(input)?;
    let port = opt(preceded(':', digit1.try_map(str::parse::<u16>))).parse_next(input)?;
    Ok(RedirectTarget {
        user: user.map(str::to_string),
        host: host.to_string(),
        port,
    })
}

/// Parse a `[REFERRAL/<authority>]` reply body. The closing bracket must
/// directly follow the authority; free-form reply text may follow it.
/// Userinfo is percent-decoded.
pub fn parse_referral(reply: &str) -> Option<RedirectTarget> {
    let mut input = reply.strip_prefix("[REFERRAL/")?;
    let mut target = authority(&mut input).ok()?;
    input.strip_prefix(']')?;
    if let Some(user) = target.user.take() {
        let decoded = percent_decode_str(&user).decode_utf8().ok()?;
        target.user = Some(decoded.into_owned());
    }
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::parse_referral;

    #[test]
    fn test_host_only() {
        let target = parse_referral("[REFERRAL/mail.example.com]").unwrap();
        assert_eq!(target.user, None);
        assert_eq!(target.host, "mail.example.com");
        assert_eq!(target.port, None);
        assert_eq!(target.to_string(), "mail.example.com");
    }

    #[test]
    fn test_user_host_port() {
        let target = parse_referral("[REFERRAL/alice@10.0.0.2:110] try another host").unwrap();
        assert_eq!(target.user.as_deref(), Some("alice"));
        assert_eq!(target.host, "10.0.0.2");
        assert_eq!(target.port, Some(110));
        assert_eq!(target.to_string(), "alice@10.0.0.2:110");
    }

    #[test]
    fn test_bracketed_ip6_literal() {
        let target = parse_referral("[REFERRAL/[2001:db8::1]:995]").unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, Some(995));
        assert_eq!(target.to_string(), "[2001:db8::1]:995");
    }

    #[test]
    fn test_percent_decoded_userinfo() {
        let target = parse_referral("[REFERRAL/alice%40corp@mail.example.com]").unwrap();
        assert_eq!(target.user.as_deref(), Some("alice@corp"));
    }

    #[test]
    fn test_rejects_unclosed_bracket() {
        assert!(parse_referral("[REFERRAL/mail.example.com").is_none());
    }

    #[test]
    fn test_rejects_trailing_garbage_after_authority() {
        assert!(parse_referral("[REFERRAL/mail.example.com/inbox]").is_none());
        assert!(parse_referral("[REFERRAL/mail.example.com junk]").is_none());
    }

    #[test]
    fn test_rejects_bad_hosts() {
        assert!(parse_referral("[REFERRAL/]").is_none());
        assert!(parse_referral("[REFERRAL/-bad-.example.com]").is_none());
        assert!(parse_referral("[REFERRAL/[not:v6:junk::zz]]").is_none());
        assert!(parse_referral("[REFERRAL/mail.example.com:99999]").is_none());
    }

    #[test]
    fn test_non_referral_body() {
        assert!(parse_referral("[SYS/TEMP] DB down").is_none());
    }
}
