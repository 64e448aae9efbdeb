use bit_set::BitSet;
use log::debug;

use crate::raptor::time::DeltaTime;

use super::Timetable;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RtError {
    #[error("Real-time transport needs at least two stops, got {0}")]
    TooFewStops(usize),
    #[error("Unknown location {0}")]
    UnknownLocation(usize),
    #[error("Unknown static transport {0}")]
    UnknownTransport(usize),
    #[error("Real-time transport goes back in time at stop {0}")]
    NonMonotonicTimes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtStop {
    pub location: usize,
    pub arrival: DeltaTime,
    pub departure: DeltaTime,
}

#[derive(Debug, Clone)]
struct RtTransport {
    static_transport: Option<usize>,
    name: Option<String>,
    stops: Vec<RtStop>,
}

/// Real-time updates layered over a static timetable. Static transports can be cancelled, and
/// additional transports with their own stop sequence can be added. Added transports don't
/// belong to any route, so the search visits them through a separate set of marks.
#[derive(Debug, Clone)]
pub struct RtTimetable {
    n_locations: usize,
    n_static_transports: usize,
    cancelled: BitSet,
    transports: Vec<RtTransport>,
    location_transports: Vec<Vec<(usize, usize)>>,
}

impl RtTimetable {
    pub fn new(timetable: &dyn Timetable) -> RtTimetable {
        RtTimetable {
            n_locations: timetable.n_locations(),
            n_static_transports: timetable.n_transports(),
            cancelled: BitSet::with_capacity(timetable.n_transports()),
            transports: vec![],
            location_transports: vec![vec![]; timetable.n_locations()],
        }
    }

    pub fn cancel(&mut self, transport: usize) -> Result<(), RtError> {
        if transport >= self.n_static_transports {
            return Err(RtError::UnknownTransport(transport));
        }
        self.cancelled.insert(transport);
        Ok(())
    }

    #[inline]
    pub fn is_cancelled(&self, transport: usize) -> bool {
        self.cancelled.contains(transport)
    }

    /// Adds a transport. If it replaces a static transport, that one is cancelled.
    pub fn add_transport(
        &mut self,
        replaces: Option<usize>,
        name: Option<&str>,
        stops: Vec<RtStop>,
    ) -> Result<usize, RtError> {
        if stops.len() < 2 {
            return Err(RtError::TooFewStops(stops.len()));
        }
        let mut previous = DeltaTime::from_minutes(i16::MIN);
        for (seq, stop) in stops.iter().enumerate() {
            if stop.location >= self.n_locations {
                return Err(RtError::UnknownLocation(stop.location));
            }
            if !stop.arrival.is_valid()
                || !stop.departure.is_valid()
                || stop.arrival < previous
                || stop.departure < stop.arrival
            {
                return Err(RtError::NonMonotonicTimes(seq));
            }
            previous = stop.departure;
        }
        if let Some(transport) = replaces {
            self.cancel(transport)?;
        }

        let rt_transport = self.transports.len();
        for (seq, stop) in stops.iter().enumerate() {
            self.location_transports[stop.location].push((rt_transport, seq));
        }
        self.transports.push(RtTransport {
            static_transport: replaces,
            name: name.map(str::to_string),
            stops,
        });
        debug!(
            "Added real-time transport {} replacing {:?}",
            rt_transport, replaces
        );
        Ok(rt_transport)
    }

    #[inline]
    pub fn n_rt_transports(&self) -> usize {
        self.transports.len()
    }

    pub fn n_cancelled(&self) -> usize {
        self.cancelled.len()
    }

    /// Real-time transports calling at a location, with the stop's position in each.
    #[inline]
    pub fn transports_at(&self, location: usize) -> &[(usize, usize)] {
        &self.location_transports[location]
    }

    #[inline]
    pub fn stops(&self, rt_transport: usize) -> &[RtStop] {
        &self.transports[rt_transport].stops
    }

    pub fn static_transport(&self, rt_transport: usize) -> Option<usize> {
        self.transports[rt_transport].static_transport
    }

    pub fn name(&self, rt_transport: usize) -> Option<&str> {
        self.transports[rt_transport].name.as_deref()
    }
}

#[cfg(test)]
mod test {
    use crate::raptor::{
        time::DeltaTime,
        timetable::{fixtures, Timetable},
    };

    use super::{RtError, RtStop, RtTimetable};

    fn rt_stop(location: usize, arrival: i16, departure: i16) -> RtStop {
        RtStop {
            location,
            arrival: DeltaTime::from_minutes(arrival),
            departure: DeltaTime::from_minutes(departure),
        }
    }

    #[test]
    fn replacement_cancels_static_transport() {
        let tt = fixtures::line_abc();
        let mut rtt = RtTimetable::new(&tt);
        assert!(!rtt.is_cancelled(0));
        let rt = rtt
            .add_transport(
                Some(0),
                Some("1"),
                vec![rt_stop(0, 5, 5), rt_stop(1, 15, 16), rt_stop(2, 25, 25)],
            )
            .unwrap();
        assert_eq!(rt, 0);
        assert!(rtt.is_cancelled(0));
        assert_eq!(rtt.n_cancelled(), 1);
        assert_eq!(rtt.n_rt_transports(), 1);
        assert_eq!(rtt.static_transport(rt), Some(0));
        assert_eq!(rtt.name(rt), Some("1"));
        assert_eq!(rtt.transports_at(1), &[(0, 1)]);
        assert_eq!(rtt.stops(rt)[2].arrival, DeltaTime::from_minutes(25));
        assert_eq!(tt.n_transports(), 1);
    }

    #[test]
    fn invalid_updates_are_rejected() {
        let tt = fixtures::line_abc();
        let mut rtt = RtTimetable::new(&tt);
        assert_eq!(rtt.cancel(3), Err(RtError::UnknownTransport(3)));
        assert_eq!(
            rtt.add_transport(None, None, vec![rt_stop(0, 0, 0)]),
            Err(RtError::TooFewStops(1))
        );
        assert_eq!(
            rtt.add_transport(None, None, vec![rt_stop(0, 0, 0), rt_stop(9, 5, 5)]),
            Err(RtError::UnknownLocation(9))
        );
        assert_eq!(
            rtt.add_transport(None, None, vec![rt_stop(0, 10, 10), rt_stop(1, 5, 5)]),
            Err(RtError::NonMonotonicTimes(1))
        );
        assert_eq!(
            rtt.add_transport(Some(4), None, vec![rt_stop(0, 0, 0), rt_stop(1, 5, 5)]),
            Err(RtError::UnknownTransport(4))
        );
        assert_eq!(rtt.n_rt_transports(), 0);
        assert!(rtt.transports_at(0).is_empty());
    }
}
