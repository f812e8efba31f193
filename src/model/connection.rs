//! One WebRTC connection per plugin handle
//!
//! Wraps a sans-IO [`Rtc`] instance. The publisher connection offers a single
//! send-only video m-line; receiving connections answer the gateway's offer.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::format::Codec;
use str0m::media::{Direction, KeyframeRequestKind, MediaData, MediaKind, MediaTime, Mid, Rid};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::janus::message::Jsep;
use crate::media::VideoFrame;
use crate::model::codec::VideoCodec;
use crate::model::handle::Role;
use crate::model::propagated::Propagated;
use crate::model::tracks::{TrackIn, TrackInEntry, TrackOut, TrackOutState};

#[derive(Debug)]
pub struct Connection {
    pub role: Role,
    pub rtc: Rtc,
    pending: Option<SdpPendingOffer>,
    track_out: Option<TrackOut>,
    pub tracks_in: Vec<TrackInEntry>,
    connected: bool,
}

impl Connection {
    /// Create a connection that will publish `codec` video.
    pub fn publisher(codec: VideoCodec, candidates: &[Candidate]) -> Self {
        let builder = Rtc::builder().clear_codecs();
        let builder = match codec {
            VideoCodec::Vp8 => builder.enable_vp8(true),
            VideoCodec::Vp9 => builder.enable_vp9(true),
            VideoCodec::H264 => builder.enable_h264(true),
        };

        let mut connection = Self::new(Role::Publisher, builder.build(), candidates);
        connection.track_out = Some(TrackOut::new());
        connection
    }

    /// Create a connection that receives whatever the gateway offers.
    pub fn receiver(role: Role, candidates: &[Candidate]) -> Self {
        Self::new(role, Rtc::builder().build(), candidates)
    }

    fn new(role: Role, mut rtc: Rtc, candidates: &[Candidate]) -> Self {
        for candidate in candidates {
            rtc.add_local_candidate(candidate.clone());
        }

        Self {
            role,
            rtc,
            pending: None,
            track_out: None,
            tracks_in: vec![],
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The Mid of the published track once it can carry media.
    pub fn local_mid(&self) -> Option<Mid> {
        self.track_out.as_ref().and_then(TrackOut::open_mid)
    }

    /// Produce the send-only video offer for the publisher.
    pub fn create_offer(&mut self) -> RelayResult<Jsep> {
        let Some(track) = self.track_out.as_mut() else {
            return Err(RelayError::negotiation(self.role, "nothing to publish"));
        };
        if self.pending.is_some() {
            return Err(RelayError::negotiation(self.role, "offer already pending"));
        }

        let mut change = self.rtc.sdp_api();
        let mid = change.add_media(
            MediaKind::Video,
            Direction::SendOnly,
            Some(self.role.to_string()),
            None,
            None,
        );

        let (offer, pending) = change
            .apply()
            .ok_or_else(|| RelayError::negotiation(self.role, "no changes to offer"))?;

        track.state = TrackOutState::Negotiating(mid);
        self.pending = Some(pending);

        info!("📝 {}: created offer for mid {:?}", self.role, mid);
        Ok(Jsep::offer(offer.to_sdp_string()))
    }

    /// Apply the gateway's answer to our pending offer.
    pub fn accept_answer(&mut self, jsep: &Jsep) -> RelayResult<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| RelayError::negotiation(self.role, "answer without a pending offer"))?;

        let answer = SdpAnswer::from_sdp_string(&jsep.sdp)
            .map_err(|e| RelayError::negotiation(self.role, e))?;

        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| RelayError::negotiation(self.role, e))?;

        if let Some(track) = self.track_out.as_mut() {
            if let TrackOutState::Negotiating(m) = track.state {
                track.state = TrackOutState::Open(m);
            }
        }

        info!("✅ {}: answer accepted", self.role);
        Ok(())
    }

    /// Answer an offer from the gateway.
    pub fn accept_offer(&mut self, jsep: &Jsep) -> RelayResult<Jsep> {
        let offer = SdpOffer::from_sdp_string(&jsep.sdp)
            .map_err(|e| RelayError::negotiation(self.role, e))?;

        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| RelayError::negotiation(self.role, e))?;

        info!("📝 {}: created answer", self.role);
        Ok(Jsep::answer(answer.to_sdp_string()))
    }

    /// Add a candidate trickled by the gateway.
    pub fn add_remote_candidate(&mut self, candidate: &str) {
        let line = candidate.trim_start_matches("a=");
        match Candidate::from_sdp_string(line) {
            Ok(c) => {
                self.rtc.add_remote_candidate(c);
            }
            Err(e) => warn!("{}: ignoring remote candidate {:?}: {:?}", self.role, line, e),
        }
    }

    pub fn accepts(&self, input: &Input) -> bool {
        self.rtc.accepts(input)
    }

    pub fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("{} disconnected: {:?}", self.role, e);
            self.rtc.disconnect();
        }
    }

    pub fn poll_output(&mut self, socket: &UdpSocket) -> Propagated {
        if !self.rtc.is_alive() {
            return Propagated::Disconnected(self.role);
        }

        match self.rtc.poll_output() {
            Ok(output) => self.handle_output(output, socket),
            Err(e) => {
                warn!("{} poll_output failed: {:?}", self.role, e);
                self.rtc.disconnect();
                Propagated::Disconnected(self.role)
            }
        }
    }

    fn handle_output(&mut self, output: Output, socket: &UdpSocket) -> Propagated {
        match output {
            Output::Transmit(transmit) => {
                if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                    // UDP is lossy anyway, a full socket buffer just drops the packet.
                    if e.kind() != ErrorKind::WouldBlock {
                        warn!("{}: send to {} failed: {}", self.role, transmit.destination, e);
                    }
                }
                Propagated::Noop
            }
            Output::Timeout(t) => Propagated::Timeout(t),
            Output::Event(e) => match e {
                Event::IceConnectionStateChange(state) => {
                    info!("🔌 {}: ICE state = {:?}", self.role, state);
                    if state == IceConnectionState::Disconnected {
                        // No ICE restart, the handle is gone for us.
                        self.rtc.disconnect();
                        return Propagated::Disconnected(self.role);
                    }
                    Propagated::Noop
                }
                Event::Connected => {
                    info!("🎉 {}: connected", self.role);
                    self.connected = true;
                    Propagated::Connected(self.role)
                }
                Event::MediaAdded(e) => self.handle_media_added(e.mid, e.kind),
                Event::MediaData(data) => self.handle_media_data_in(data),
                Event::KeyframeRequest(req) => {
                    debug!("{}: keyframe requested on {:?}", self.role, req.mid);
                    Propagated::KeyframeRequest(self.role)
                }
                _ => Propagated::Noop,
            },
        }
    }

    fn handle_media_added(&mut self, mid: Mid, kind: MediaKind) -> Propagated {
        // Our own send-only m-line shows up here too.
        if self.track_out.as_ref().and_then(TrackOut::mid) == Some(mid) {
            return Propagated::Noop;
        }

        let track = TrackIn {
            mid,
            kind,
        };
        self.tracks_in.push(TrackInEntry {
            track,
            last_keyframe_request: None,
        });

        Propagated::TrackOpen(self.role, mid, kind)
    }

    fn handle_media_data_in(&mut self, data: MediaData) -> Propagated {
        let is_video = self
            .tracks_in
            .iter()
            .any(|t| t.track.mid == data.mid && t.track.kind == MediaKind::Video);
        if !is_video {
            return Propagated::Noop;
        }

        if !data.contiguous {
            self.request_keyframe_throttled(data.mid, data.rid, KeyframeRequestKind::Pli);
        }

        Propagated::MediaData(self.role, data)
    }

    fn request_keyframe_throttled(
        &mut self,
        mid: Mid,
        rid: Option<Rid>,
        kind: KeyframeRequestKind,
    ) {
        let Some(mut writer) = self.rtc.writer(mid) else {
            return;
        };

        let Some(entry) = self.tracks_in.iter_mut().find(|t| t.track.mid == mid) else {
            return;
        };

        if entry
            .last_keyframe_request
            .map(|t| t.elapsed() < Duration::from_secs(1))
            .unwrap_or(false)
        {
            return;
        }

        _ = writer.request_keyframe(rid, kind);

        entry.last_keyframe_request = Some(Instant::now());
    }

    /// Write a local frame on the published track. Returns false when the
    /// track cannot carry media yet.
    pub fn write_frame(&mut self, frame: &VideoFrame) -> RelayResult<bool> {
        if !self.connected {
            return Ok(false);
        }
        let Some(mid) = self.local_mid() else {
            return Ok(false);
        };
        let Some(writer) = self.rtc.writer(mid) else {
            return Ok(false);
        };

        let wanted = to_str0m_codec(frame.codec);
        let Some(pt) = writer
            .payload_params()
            .find(|p| p.spec().codec == wanted)
            .map(|p| p.pt())
        else {
            return Err(RelayError::negotiation(
                self.role,
                format!("gateway did not accept {}", frame.codec),
            ));
        };

        let rtp_time = MediaTime::from_90khz(frame.rtp_time);
        if let Err(e) = writer.write(pt, Instant::now(), rtp_time, frame.data.clone()) {
            warn!("{}: write failed: {:?}", self.role, e);
            self.rtc.disconnect();
            return Ok(false);
        }

        Ok(true)
    }

    pub fn disconnect(&mut self) {
        self.rtc.disconnect();
    }
}

fn to_str0m_codec(codec: VideoCodec) -> Codec {
    match codec {
        VideoCodec::Vp8 => Codec::Vp8,
        VideoCodec::Vp9 => Codec::Vp9,
        VideoCodec::H264 => Codec::H264,
    }
}

/// Map a received frame's codec back to ours; `None` for codecs we cannot
/// render.
pub fn from_str0m_codec(codec: Codec) -> Option<VideoCodec> {
    match codec {
        Codec::Vp8 => Some(VideoCodec::Vp8),
        Codec::Vp9 => Some(VideoCodec::Vp9),
        Codec::H264 => Some(VideoCodec::H264),
        _ => None,
    }
}

/// Convert received media data into a frame for a surface.
pub fn to_video_frame(data: &MediaData) -> Option<VideoFrame> {
    let codec = from_str0m_codec(data.params.spec().codec)?;
    Some(VideoFrame {
        codec,
        rtp_time: data.time.numer(),
        data: data.data.clone(),
    })
}
