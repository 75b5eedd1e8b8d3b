//! SDP helpers
//!
//! Lightweight text-level processing of session descriptions: extracting
//! the media list from a remote offer, inferring the connection role for
//! the synchronous signaling path, and folding ICE candidates into a
//! complete answer.

/// Media kind carried by an SDP section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Media direction from this server's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sendonly,
    Recvonly,
    Sendrecv,
    Inactive,
}

/// One negotiated media section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Media {
    pub kind: MediaKind,
    pub direction: Direction,
}

/// Parse the media sections of a remote offer.
///
/// Directions are mirrored so they describe what *this* side does: a
/// client offering `a=recvonly` wants to receive, which makes the media
/// `sendonly` for us. Sections other than audio/video (e.g. application)
/// are skipped.
pub fn parse_medias(sdp: &str) -> Vec<Media> {
    let mut medias = Vec::new();
    let mut current: Option<Media> = None;

    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("m=") {
            if let Some(media) = current.take() {
                medias.push(media);
            }
            current = match rest.split(' ').next() {
                Some("video") => Some(Media { kind: MediaKind::Video, direction: Direction::Sendrecv }),
                Some("audio") => Some(Media { kind: MediaKind::Audio, direction: Direction::Sendrecv }),
                _ => None,
            };
        } else if let Some(ref mut media) = current {
            // remote attribute, mirrored to our perspective
            match line {
                "a=sendonly" => media.direction = Direction::Recvonly,
                "a=recvonly" => media.direction = Direction::Sendonly,
                "a=sendrecv" => media.direction = Direction::Sendrecv,
                "a=inactive" => media.direction = Direction::Inactive,
                _ => {}
            }
        }
    }
    if let Some(media) = current {
        medias.push(media);
    }
    medias
}

/// Classify a connection as consumer or producer from its medias.
///
/// Used only by the synchronous HTTP signaling path, which has no
/// src/dst query parameter to advertise the role:
/// 1. any video we send -> consumer
/// 2. else any video we receive -> producer
/// 3. else anything we send -> consumer
/// 4. otherwise -> producer
pub fn is_consumer(medias: &[Media]) -> bool {
    for media in medias {
        if media.kind == MediaKind::Video && media.direction == Direction::Sendonly {
            return true;
        }
    }
    for media in medias {
        if media.kind == MediaKind::Video && media.direction == Direction::Recvonly {
            return false;
        }
    }
    for media in medias {
        if media.direction == Direction::Sendonly {
            return true;
        }
    }
    false
}

/// Rewrite a complete answer: drop gathered candidates rejected by the
/// filter and append the manually configured candidate lines to the
/// first media section (sufficient under BUNDLE).
pub fn fold_candidates<F>(sdp: &str, extra: &[String], keep: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut out: Vec<String> = Vec::new();
    let mut media_index = 0usize;
    let mut inserted = extra.is_empty();

    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("m=") {
            media_index += 1;
            if media_index == 2 && !inserted {
                for cand in extra {
                    out.push(format!("a={}", cand));
                }
                inserted = true;
            }
        }
        if let Some(value) = line.strip_prefix("a=") {
            if value.starts_with("candidate:") && !keep(value) {
                continue;
            }
        }
        out.push(line.to_string());
    }

    if !inserted {
        for cand in extra {
            out.push(format!("a={}", cand));
        }
    }

    let mut folded = out.join("\r\n");
    folded.push_str("\r\n");
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIEWER_OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=recvonly\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=recvonly\r\n";

    const PUBLISHER_OFFER: &str = "v=0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=sendonly\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=sendonly\r\n";

    #[test]
    fn parse_mirrors_directions() {
        let medias = parse_medias(VIEWER_OFFER);
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].kind, MediaKind::Video);
        assert_eq!(medias[0].direction, Direction::Sendonly);
        assert_eq!(medias[1].kind, MediaKind::Audio);
        assert_eq!(medias[1].direction, Direction::Sendonly);
    }

    #[test]
    fn parse_defaults_to_sendrecv_and_skips_application() {
        let sdp = "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nm=video 9 RTP 96\r\n";
        let medias = parse_medias(sdp);
        assert_eq!(medias.len(), 1);
        assert_eq!(medias[0].direction, Direction::Sendrecv);
    }

    #[test]
    fn viewer_offer_is_consumer() {
        assert!(is_consumer(&parse_medias(VIEWER_OFFER)));
    }

    #[test]
    fn publisher_offer_is_producer() {
        assert!(!is_consumer(&parse_medias(PUBLISHER_OFFER)));
    }

    #[test]
    fn audio_only_sender_is_consumer() {
        let medias = [Media { kind: MediaKind::Audio, direction: Direction::Sendonly }];
        assert!(is_consumer(&medias));
    }

    #[test]
    fn inactive_only_is_producer() {
        let medias = [Media { kind: MediaKind::Video, direction: Direction::Inactive }];
        assert!(!is_consumer(&medias));
    }

    #[test]
    fn fold_appends_to_first_media_section() {
        let sdp = "v=0\r\nm=video 9 RTP 96\r\na=mid:0\r\nm=audio 9 RTP 111\r\na=mid:1\r\n";
        let extra = vec!["candidate:1 1 udp 2130706431 192.168.1.2 8555 typ host".to_string()];
        let folded = fold_candidates(sdp, &extra, |_| true);
        let video_at = folded.find("m=video").unwrap();
        let cand_at = folded.find("a=candidate:1").unwrap();
        let audio_at = folded.find("m=audio").unwrap();
        assert!(video_at < cand_at && cand_at < audio_at);
    }

    #[test]
    fn fold_strips_rejected_candidates() {
        let sdp = "v=0\r\nm=video 9 RTP 96\r\n\
a=candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host\r\n\
a=candidate:2 1 tcp 1671430143 10.0.0.1 5001 typ host tcptype passive\r\n";
        let folded = fold_candidates(sdp, &[], |c| c.contains(" udp "));
        assert!(folded.contains("candidate:1"));
        assert!(!folded.contains("candidate:2"));
    }
}
